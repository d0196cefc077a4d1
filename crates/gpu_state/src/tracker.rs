//! Per-context barrier tracking.
//!
//! A context does not know the state its resources will be in when its
//! command list starts executing, because other contexts may be submitted
//! before it. The first time it touches a resource the transition is parked
//! as a [`PendingTransition`], to be resolved against the global registry at
//! submission. Every later transition of that resource in the same context
//! is resolved locally against the state the context itself left behind.

use std::collections::{hash_map::Entry, BTreeMap, HashMap, HashSet};

use smallvec::SmallVec;

use crate::{
    backend::{Backend, CommandList},
    resolve::BatchResolver,
    state::{Barrier, BarrierFlags, ResourceId, ResourceStates, Subresource, TransitionBarrier},
};

/// A transition whose prior state is not yet known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTransition {
    pub resource: ResourceId,
    pub subresource: Subresource,
    pub after: ResourceStates,
    pub flags: BarrierFlags,
    /// Subresources already tracked by the context when the transition was
    /// requested. Resolution leaves them alone.
    pub skip: SmallVec<[u32; 4]>,
}

/// What a context knows about the state it leaves a resource in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalState {
    whole: Option<ResourceStates>,
    subresources: BTreeMap<u32, ResourceStates>,
}

impl LocalState {
    /// The whole-resource state, or `None` if the context only ever touched
    /// individual subresources.
    #[must_use]
    pub fn whole(&self) -> Option<ResourceStates> {
        self.whole
    }

    pub fn subresource_states(&self) -> impl Iterator<Item = (u32, ResourceStates)> + '_ {
        self.subresources.iter().map(|(index, state)| (*index, *state))
    }

    fn get(&self, index: u32) -> Option<ResourceStates> {
        self.subresources.get(&index).copied().or(self.whole)
    }
}

#[derive(Default)]
pub struct ResourceStateTracker {
    final_states: HashMap<ResourceId, LocalState>,
    pending: Vec<PendingTransition>,
    resolved: Vec<Barrier>,
    /// Resources whose only transition in this context was the first-touch
    /// whole-resource one.
    first_touch_only: HashSet<ResourceId>,
}

impl ResourceStateTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that `subresource` of `resource` be in `after` from this
    /// point of the command stream on.
    ///
    /// Transitions to the state the resource is already in are recorded as
    /// they are.
    pub fn transition_resource(
        &mut self,
        resource: ResourceId,
        after: ResourceStates,
        subresource: Subresource,
        flags: BarrierFlags,
    ) {
        let local = match self.final_states.entry(resource) {
            Entry::Vacant(entry) => {
                self.pending.push(PendingTransition {
                    resource,
                    subresource,
                    after,
                    flags,
                    skip: SmallVec::new(),
                });

                let mut local = LocalState::default();
                match subresource {
                    Subresource::All => {
                        local.whole = Some(after);
                        self.first_touch_only.insert(resource);
                    }
                    Subresource::Index(index) => {
                        local.subresources.insert(index, after);
                    }
                }
                entry.insert(local);
                return;
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };

        self.first_touch_only.remove(&resource);

        let transition = |subresource, before| {
            Barrier::Transition(TransitionBarrier {
                resource,
                subresource,
                before,
                after,
                flags,
            })
        };

        match subresource {
            Subresource::All => {
                if local.subresources.is_empty() {
                    match local.whole {
                        Some(before) => self.resolved.push(transition(Subresource::All, before)),
                        None => unreachable!("tracked resource without any state"),
                    }
                } else {
                    for (&index, &before) in &local.subresources {
                        self.resolved.push(transition(Subresource::Index(index), before));
                    }

                    if local.whole.is_none() {
                        // The rest of the resource has not been touched yet.
                        self.pending.push(PendingTransition {
                            resource,
                            subresource: Subresource::All,
                            after,
                            flags,
                            skip: local.subresources.keys().copied().collect(),
                        });
                    }
                }

                local.whole = Some(after);
                local.subresources.clear();
            }
            Subresource::Index(index) => {
                match local.get(index) {
                    Some(before) => self.resolved.push(transition(subresource, before)),
                    None => self.pending.push(PendingTransition {
                        resource,
                        subresource,
                        after,
                        flags,
                        skip: SmallVec::new(),
                    }),
                }
                local.subresources.insert(index, after);
            }
        }
    }

    /// Records any barrier. Transitions go through
    /// [`Self::transition_resource`]; UAV and aliasing barriers are recorded
    /// as they are.
    pub fn resource_barrier(&mut self, barrier: Barrier) {
        match barrier {
            Barrier::Transition(transition) => self.transition_resource(
                transition.resource,
                transition.after,
                transition.subresource,
                transition.flags,
            ),
            other => self.resolved.push(other),
        }
    }

    /// Writes every resolved barrier into `list` as one batch.
    pub fn flush_resource_barriers<B: Backend>(&mut self, list: &mut B::CommandList) {
        if !self.resolved.is_empty() {
            list.resource_barrier(&self.resolved);
            self.resolved.clear();
        }
    }

    /// Resolves the pending transitions against `resolver` and records them
    /// into `list`, which has to execute before the list that requested them.
    ///
    /// ## Returns
    ///
    /// The number of barriers recorded.
    pub fn flush_pending_resource_barriers<B: Backend>(
        &mut self,
        list: &mut B::CommandList,
        resolver: &mut BatchResolver<'_>,
    ) -> usize {
        let barriers = resolver.resolve(self);
        if !barriers.is_empty() {
            list.resource_barrier(&barriers);
        }
        barriers.len()
    }

    /// The state this context leaves `resource` in, if it touched it.
    #[must_use]
    pub fn final_state(&self, resource: ResourceId) -> Option<&LocalState> {
        self.final_states.get(&resource)
    }

    pub fn final_states(&self) -> impl Iterator<Item = (ResourceId, &LocalState)> + '_ {
        self.final_states.iter().map(|(resource, state)| (*resource, state))
    }

    #[must_use]
    pub fn pending_barriers(&self) -> &[PendingTransition] {
        &self.pending
    }

    pub(crate) fn take_pending(&mut self) -> Vec<PendingTransition> {
        std::mem::take(&mut self.pending)
    }

    #[must_use]
    pub fn resolved(&self) -> &[Barrier] {
        &self.resolved
    }

    pub(crate) fn take_resolved(&mut self) -> Vec<Barrier> {
        std::mem::take(&mut self.resolved)
    }

    #[must_use]
    pub fn is_first_touch_only(&self, resource: ResourceId) -> bool {
        self.first_touch_only.contains(&resource)
    }

    pub fn reset(&mut self) {
        self.final_states.clear();
        self.pending.clear();
        self.resolved.clear();
        self.first_touch_only.clear();
    }
}
