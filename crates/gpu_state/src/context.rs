use crate::{
    backend::{Backend, QueueKind},
    command::CommandBuffer,
    state::{Barrier, BarrierFlags, ResourceId, ResourceStates, Subresource},
    tracker::ResourceStateTracker,
};

/// A command list being recorded, with the barrier tracking for it.
///
/// Contexts are independent of each other and can be recorded on different
/// threads. Their barriers are reconciled when they are executed together.
pub struct Context<B: Backend> {
    command: CommandBuffer<B>,
    tracker: ResourceStateTracker,
}

impl<B: Backend> Context<B> {
    pub(crate) fn new(command: CommandBuffer<B>) -> Self {
        Self {
            command,
            tracker: ResourceStateTracker::new(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> QueueKind {
        self.command.kind()
    }

    pub fn transition(&mut self, resource: ResourceId, state: ResourceStates) {
        self.tracker
            .transition_resource(resource, state, Subresource::All, BarrierFlags::NONE);
    }

    pub fn transition_subresource(&mut self, resource: ResourceId, state: ResourceStates, index: u32) {
        self.tracker.transition_resource(
            resource,
            state,
            Subresource::Index(index),
            BarrierFlags::NONE,
        );
    }

    pub fn transition_with_flags(
        &mut self,
        resource: ResourceId,
        state: ResourceStates,
        subresource: Subresource,
        flags: BarrierFlags,
    ) {
        self.tracker
            .transition_resource(resource, state, subresource, flags);
    }

    /// Orders UAV accesses to `resource`, or to all resources if `None`.
    pub fn uav_barrier(&mut self, resource: Option<ResourceId>) {
        self.tracker.resource_barrier(Barrier::UnorderedAccess(resource));
    }

    pub fn aliasing_barrier(&mut self, before: Option<ResourceId>, after: Option<ResourceId>) {
        self.tracker
            .resource_barrier(Barrier::Aliasing { before, after });
    }

    /// Records the barriers requested so far. Must be called before recording
    /// commands that depend on them.
    pub fn flush_resource_barriers(&mut self) {
        self.tracker
            .flush_resource_barriers::<B>(self.command.list_mut());
    }

    /// The native list, for recording draws, dispatches and copies.
    /// Call [`Self::flush_resource_barriers`] first.
    pub fn command_list(&mut self) -> &mut B::CommandList {
        self.command.list_mut()
    }

    #[must_use]
    pub fn tracker(&self) -> &ResourceStateTracker {
        &self.tracker
    }

    pub(crate) fn into_parts(self) -> (CommandBuffer<B>, ResourceStateTracker) {
        (self.command, self.tracker)
    }
}
