use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    backend::{Backend, CommandList, Queue, QueueKind},
    command::{CommandBuffer, CommandListRing},
    context::Context,
    error::{Error, Result},
    fence::{QueueFences, SubmissionId},
    memory::dynamic_buffer::DynamicBufferAllocator,
    registry::ResourceStateRegistry,
    resolve::BatchResolver,
    Config,
};

/// Per-frame command recording and submission.
///
/// Owns a ring of command buffers and dynamic upload memory for each frame in
/// flight, and executes batches of contexts with their barriers reconciled
/// against the shared [`ResourceStateRegistry`].
pub struct FrameResource<B: Backend> {
    registry: Arc<ResourceStateRegistry>,
    queues: [Option<Arc<B::Queue>>; QueueKind::COUNT],
    fences: QueueFences<B>,
    ring: CommandListRing<B>,
    dynamic_buffers: Box<[DynamicBufferAllocator<B>]>,
    /// Everything submitted since the last `end_frame`.
    frame_submission: SubmissionId,
    frame_number: u64,
}

impl<B: Backend> FrameResource<B> {
    /// Contexts can only be created for the kinds of `queues`.
    pub fn new(
        device: &B::Device,
        registry: Arc<ResourceStateRegistry>,
        queues: impl IntoIterator<Item = Arc<B::Queue>>,
        config: &Config,
    ) -> Result<Self> {
        let mut by_kind: [Option<Arc<B::Queue>>; QueueKind::COUNT] = Default::default();
        for queue in queues {
            let index = queue.kind().index();
            by_kind[index] = Some(queue);
        }

        let dynamic_buffers = (0..config.frames_in_flight)
            .map(|_| DynamicBufferAllocator::<B>::new(device, config.dynamic_buffer_block_size))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            registry,
            queues: by_kind,
            fences: QueueFences::<B>::new(device)?,
            ring: CommandListRing::<B>::new(
                device,
                config.frames_in_flight,
                config.command_lists_per_frame,
            )?,
            dynamic_buffers: dynamic_buffers.into_boxed_slice(),
            frame_submission: SubmissionId::default(),
            frame_number: 0,
        })
    }

    /// Index of the current frame slot.
    #[must_use]
    pub fn frame_index(&self) -> usize {
        self.ring.frame_index()
    }

    /// The number of frames ended so far.
    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    #[must_use]
    pub fn queue(&self, kind: QueueKind) -> Option<&Arc<B::Queue>> {
        self.queues[kind.index()].as_ref()
    }

    /// Waits until the GPU is done with the work last submitted from this
    /// frame slot, then recycles the slot's command buffers and upload
    /// memory.
    pub fn begin_frame(&mut self) -> Result<()> {
        self.ring.begin_frame(&self.fences)?;
        self.dynamic_buffers[self.ring.frame_index()].reset();
        Ok(())
    }

    /// Hands the current slot's submissions over to the ring and moves on to
    /// the next slot.
    pub fn end_frame(&mut self) {
        let submission = std::mem::take(&mut self.frame_submission);
        self.ring.end_frame(submission);
        self.frame_number += 1;
    }

    pub fn create_context(&mut self, kind: QueueKind) -> Result<Context<B>> {
        if self.queues[kind.index()].is_none() {
            return Err(Error::InvalidConfig("no queue of the requested kind"));
        }
        Ok(Context::new(self.ring.acquire(kind)?))
    }

    /// Upload memory for the current frame, valid until the slot comes
    /// around again.
    pub fn dynamic_buffers(&mut self) -> &mut DynamicBufferAllocator<B> {
        &mut self.dynamic_buffers[self.ring.frame_index()]
    }

    /// Submits `contexts` in order. Does not wait for the GPU.
    ///
    /// The barriers each context could not resolve while recording are
    /// resolved against the state left by the contexts before it (or the
    /// registry) and recorded into a separate command list that executes
    /// just before it. Contexts are grouped by queue; each queue receives a
    /// single `execute_command_lists` call, graphics first, then compute,
    /// then copy. There is no synchronization between queues.
    ///
    /// The registry is locked from resolution of the first context until the
    /// final states of the batch are committed after submission.
    ///
    /// ## Errors
    ///
    /// If a queue rejects its batch, the queues before it keep their work.
    /// Every command buffer of the batch is still retired into the frame slot
    /// along with the partial submission, but the registry is left untouched
    /// and no longer matches the GPU. The error is fatal.
    ///
    /// ## Panics
    ///
    /// Panics if a context transitions a resource that is not registered.
    pub fn execute_contexts(&mut self, contexts: Vec<Context<B>>) -> Result<SubmissionId> {
        if contexts.is_empty() {
            return Ok(SubmissionId::default());
        }

        let context_count = contexts.len();
        let mut batches: [Vec<CommandBuffer<B>>; QueueKind::COUNT] = Default::default();
        let mut resolver = BatchResolver::new(self.registry.lock());
        let mut prologue_barriers = 0;

        for context in contexts {
            let kind = context.kind();
            let (mut command, mut tracker) = context.into_parts();

            let barriers = resolver.resolve(&mut tracker);
            if !barriers.is_empty() {
                prologue_barriers += barriers.len();
                let mut prologue = self.ring.acquire(kind)?;
                prologue.list_mut().resource_barrier(&barriers);
                prologue.close()?;
                batches[kind.index()].push(prologue);
            }

            tracker.flush_resource_barriers::<B>(command.list_mut());
            command.close()?;
            batches[kind.index()].push(command);
        }

        let submitted = submit_batches(&self.queues, &mut self.fences, &batches);

        // Any of these may be referenced by a queue that accepted its batch.
        for buffer in batches.into_iter().flatten() {
            self.ring.retire(buffer);
        }

        let submission = match submitted {
            Ok(submission) => submission,
            Err((partial, error)) => {
                self.frame_submission = self.frame_submission.merge(partial);
                log::error!(
                    target: "gpu_state::frame",
                    "submission of {context_count} contexts failed, resource states not committed: {error}"
                );
                return Err(error);
            }
        };

        resolver.commit();

        log::trace!(
            target: "gpu_state::frame",
            "executed {context_count} contexts with {prologue_barriers} resolved barriers"
        );

        self.frame_submission = self.frame_submission.merge(submission);
        Ok(submission)
    }

    #[must_use]
    pub fn is_complete(&self, submission: SubmissionId) -> bool {
        self.fences.is_complete(submission)
    }

    /// Blocks until the GPU has finished `submission`.
    pub fn wait(&self, submission: SubmissionId) -> Result<()> {
        self.fences.cpu_wait(submission)
    }

    /// Blocks until every queue is idle.
    pub fn wait_idle(&mut self) -> Result<()> {
        let mut submission = SubmissionId::default();
        for queue in self.queues.iter().flatten() {
            submission = submission.merge(self.fences.issue(queue)?);
        }
        self.fences.cpu_wait(submission)
    }
}

/// Executes each non-empty batch on its queue and signals the queue's fence.
///
/// On failure, returns what was signaled before it along with the error.
fn submit_batches<B: Backend>(
    queues: &[Option<Arc<B::Queue>>; QueueKind::COUNT],
    fences: &mut QueueFences<B>,
    batches: &[Vec<CommandBuffer<B>>; QueueKind::COUNT],
) -> Result<SubmissionId, (SubmissionId, Error)> {
    let mut submission = SubmissionId::default();
    for kind in QueueKind::ALL {
        let batch = &batches[kind.index()];
        if batch.is_empty() {
            continue;
        }

        let Some(queue) = queues[kind.index()].as_ref() else {
            let error = Error::InvalidConfig("no queue of the requested kind");
            return Err((submission, error));
        };
        let lists: SmallVec<[&B::CommandList; 16]> =
            batch.iter().map(CommandBuffer::list).collect();

        match queue
            .execute_command_lists(&lists)
            .and_then(|()| fences.issue(queue))
        {
            Ok(signaled) => submission = submission.merge(signaled),
            Err(error) => return Err((submission, error)),
        }
    }
    Ok(submission)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::headless::{self, Headless},
        backend::Device as _,
        state::{Barrier, ResourceId, ResourceState, ResourceStates, Subresource},
    };

    struct Fixture {
        device: headless::Device,
        graphics: Arc<headless::Queue>,
        registry: Arc<ResourceStateRegistry>,
        frame: FrameResource<Headless>,
    }

    fn fixture() -> Fixture {
        let device = headless::Device::new();
        let graphics = Arc::new(device.create_queue(QueueKind::Graphics).unwrap());
        let compute = Arc::new(device.create_queue(QueueKind::Compute).unwrap());
        let registry = Arc::new(ResourceStateRegistry::new());
        let config = Config {
            frames_in_flight: 2,
            command_lists_per_frame: 2,
            dynamic_buffer_block_size: 4096,
            ..Config::default()
        };
        let frame = FrameResource::<Headless>::new(
            &device,
            registry.clone(),
            [graphics.clone(), compute],
            &config,
        )
        .unwrap();

        Fixture {
            device,
            graphics,
            registry,
            frame,
        }
    }

    fn resource(f: &Fixture, state: ResourceStates) -> ResourceId {
        let id = f.device.create_resource();
        f.registry.set_resource_state(id, state);
        id
    }

    fn transition(
        resource: ResourceId,
        before: ResourceStates,
        after: ResourceStates,
    ) -> Barrier {
        Barrier::transition(resource, Subresource::All, before, after)
    }

    #[test]
    fn resolved_barriers_run_before_each_context() {
        let mut f = fixture();
        let r = resource(&f, ResourceStates::PIXEL_SHADER_RESOURCE);
        f.frame.begin_frame().unwrap();

        let mut first = f.frame.create_context(QueueKind::Graphics).unwrap();
        first.transition(r, ResourceStates::RENDER_TARGET);
        first.flush_resource_barriers();
        first.transition(r, ResourceStates::PIXEL_SHADER_RESOURCE);

        let mut second = f.frame.create_context(QueueKind::Graphics).unwrap();
        second.transition(r, ResourceStates::COPY_SOURCE);

        f.frame.execute_contexts(vec![first, second]).unwrap();

        let executions = f.device.executions();
        assert_eq!(executions.len(), 1);
        // prologue, first, prologue, second
        assert_eq!(executions[0].lists.len(), 4);
        assert_eq!(
            executions[0].barriers().copied().collect::<Vec<_>>(),
            [
                transition(
                    r,
                    ResourceStates::PIXEL_SHADER_RESOURCE,
                    ResourceStates::RENDER_TARGET
                ),
                transition(
                    r,
                    ResourceStates::RENDER_TARGET,
                    ResourceStates::PIXEL_SHADER_RESOURCE
                ),
                transition(
                    r,
                    ResourceStates::PIXEL_SHADER_RESOURCE,
                    ResourceStates::COPY_SOURCE
                ),
            ]
        );
        assert_eq!(
            f.registry.find_resource_state(r),
            Some(ResourceState::new(ResourceStates::COPY_SOURCE))
        );
        f.frame.end_frame();
    }

    #[test]
    fn failed_submission_retires_buffers_without_committing() {
        let mut f = fixture();
        let r = resource(&f, ResourceStates::PIXEL_SHADER_RESOURCE);
        f.frame.begin_frame().unwrap();

        let mut graphics = f.frame.create_context(QueueKind::Graphics).unwrap();
        graphics.transition(r, ResourceStates::RENDER_TARGET);
        let compute = f.frame.create_context(QueueKind::Compute).unwrap();
        f.frame.queue(QueueKind::Compute).unwrap().remove_device();

        let result = f.frame.execute_contexts(vec![graphics, compute]);
        assert!(matches!(result, Err(Error::Device { .. })));

        // graphics went out before compute was rejected
        let executions = f.device.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].queue, QueueKind::Graphics);
        assert_eq!(
            f.registry.find_resource_state(r),
            Some(ResourceState::new(ResourceStates::PIXEL_SHADER_RESOURCE))
        );

        f.frame.end_frame();
        f.frame.begin_frame().unwrap();
        f.frame.end_frame();
        f.frame.begin_frame().unwrap();

        // prologue and context list, then the compute list
        assert_eq!(f.frame.ring.free_count(QueueKind::Graphics), 2);
        assert_eq!(f.frame.ring.free_count(QueueKind::Compute), 1);
    }

    #[test]
    fn promotion_leaves_no_prologue() {
        let mut f = fixture();
        let r = resource(&f, ResourceStates::COMMON);
        f.frame.begin_frame().unwrap();

        let mut context = f.frame.create_context(QueueKind::Graphics).unwrap();
        context.transition(r, ResourceStates::COPY_DEST);
        let submission = f.frame.execute_contexts(vec![context]).unwrap();

        let executions = f.device.executions();
        assert_eq!(executions[0].lists.len(), 1);
        assert_eq!(executions[0].barriers().count(), 0);
        assert!(f.frame.is_complete(submission));
        assert_eq!(
            f.registry.find_resource_state(r).unwrap().whole(),
            ResourceStates::COMMON
        );
    }

    #[test]
    fn queues_get_one_execution_each() {
        let mut f = fixture();
        let r = resource(&f, ResourceStates::COMMON);
        f.frame.begin_frame().unwrap();

        let mut compute = f.frame.create_context(QueueKind::Compute).unwrap();
        compute.transition(r, ResourceStates::UNORDERED_ACCESS);
        compute.uav_barrier(Some(r));
        let graphics_a = f.frame.create_context(QueueKind::Graphics).unwrap();
        let graphics_b = f.frame.create_context(QueueKind::Graphics).unwrap();

        let submission = f
            .frame
            .execute_contexts(vec![compute, graphics_a, graphics_b])
            .unwrap();

        let executions = f.device.executions();
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].queue, QueueKind::Graphics);
        assert_eq!(executions[0].lists.len(), 2);
        assert_eq!(executions[1].queue, QueueKind::Compute);
        assert_eq!(
            executions[1].barriers().copied().collect::<Vec<_>>(),
            [
                transition(r, ResourceStates::COMMON, ResourceStates::UNORDERED_ACCESS),
                Barrier::UnorderedAccess(Some(r)),
            ]
        );

        assert!(submission.value(QueueKind::Graphics).is_some());
        assert!(submission.value(QueueKind::Compute).is_some());
        assert_eq!(submission.value(QueueKind::Copy), None);
    }

    #[test]
    fn frame_slots_wait_for_the_gpu() {
        let mut f = fixture();
        f.frame.begin_frame().unwrap();
        assert_eq!(f.frame.frame_index(), 0);

        f.graphics.hold();
        let context = f.frame.create_context(QueueKind::Graphics).unwrap();
        let submission = f.frame.execute_contexts(vec![context]).unwrap();
        assert!(!f.frame.is_complete(submission));
        f.frame.end_frame();

        // slot 1 has nothing in flight
        f.frame.begin_frame().unwrap();
        assert_eq!(f.frame.frame_index(), 1);
        f.frame.end_frame();

        f.graphics.release();
        f.frame.begin_frame().unwrap();
        assert_eq!(f.frame.frame_index(), 0);
        assert!(f.frame.is_complete(submission));
        assert_eq!(f.frame.frame_number(), 2);
    }

    #[test]
    fn dynamic_buffers_rewind_per_slot() {
        let mut f = fixture();
        f.frame.begin_frame().unwrap();
        let address = f.frame.dynamic_buffers().alloc_constant_buffer(&1u32).unwrap();
        f.frame.end_frame();

        f.frame.begin_frame().unwrap();
        let other = f.frame.dynamic_buffers().alloc_constant_buffer(&1u32).unwrap();
        assert_ne!(address, other);
        f.frame.end_frame();

        f.frame.begin_frame().unwrap();
        let again = f.frame.dynamic_buffers().alloc_constant_buffer(&1u32).unwrap();
        assert_eq!(address, again);
    }

    #[test]
    fn copy_contexts_need_a_copy_queue() {
        let mut f = fixture();
        assert!(matches!(
            f.frame.create_context(QueueKind::Copy),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn empty_batch() {
        let mut f = fixture();
        assert!(f.frame.execute_contexts(Vec::new()).unwrap().is_empty());
        assert!(f.device.executions().is_empty());
        f.frame.wait_idle().unwrap();
    }

    #[test]
    fn recording_on_worker_threads() {
        let mut f = fixture();
        let resources: Vec<_> = (0..4)
            .map(|_| resource(&f, ResourceStates::COMMON))
            .collect();
        let shared = resource(&f, ResourceStates::COMMON);
        f.frame.begin_frame().unwrap();

        let contexts: Vec<_> = (0..4)
            .map(|_| f.frame.create_context(QueueKind::Graphics).unwrap())
            .collect();

        let recorded = crossbeam::scope(|scope| {
            let workers: Vec<_> = contexts
                .into_iter()
                .zip(&resources)
                .map(|(mut context, &target)| {
                    scope.spawn(move |_| {
                        context.transition(target, ResourceStates::RENDER_TARGET);
                        context.flush_resource_barriers();
                        context.transition(target, ResourceStates::PIXEL_SHADER_RESOURCE);
                        context.transition(shared, ResourceStates::UNORDERED_ACCESS);
                        context
                    })
                })
                .collect();

            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();

        f.frame.execute_contexts(recorded).unwrap();

        for target in &resources {
            assert_eq!(
                f.registry.find_resource_state(*target).unwrap().whole(),
                ResourceStates::PIXEL_SHADER_RESOURCE
            );
        }

        // the shared resource is transitioned once, then kept in UAV state
        let shared_barriers: Vec<_> = f
            .device
            .executed_barriers()
            .into_iter()
            .filter(|barrier| {
                barrier
                    .as_transition()
                    .map_or(false, |transition| transition.resource == shared)
            })
            .collect();
        assert_eq!(
            shared_barriers,
            [
                transition(shared, ResourceStates::COMMON, ResourceStates::UNORDERED_ACCESS),
                transition(
                    shared,
                    ResourceStates::UNORDERED_ACCESS,
                    ResourceStates::UNORDERED_ACCESS
                ),
                transition(
                    shared,
                    ResourceStates::UNORDERED_ACCESS,
                    ResourceStates::UNORDERED_ACCESS
                ),
                transition(
                    shared,
                    ResourceStates::UNORDERED_ACCESS,
                    ResourceStates::UNORDERED_ACCESS
                ),
            ]
        );
    }
}
