//! Staged uploads into default-heap resources.
//!
//! Data is written into a persistently mapped staging buffer, and copy
//! commands are queued with the barriers that bracket them. A flush records
//! everything into one command list:
//!
//! ```text
//! [pre-upload barriers] [copies] [post-upload barriers]
//! ```
//!
//! and executes it on the upload queue. The staging buffer is only rewound
//! once the CPU has waited for that submission.

use std::sync::Arc;

use crate::{
    backend::{Backend, CommandList, Device, PlacedFootprint, Queue, UploadBuffer},
    command::CommandListPool,
    error::{Error, Result},
    fence::FenceSync,
    memory::linear_allocator::LinearAllocator,
    registry::ResourceStateRegistry,
    resolve::BatchResolver,
    state::{BarrierFlags, ResourceId, ResourceStates, Subresource},
    tracker::ResourceStateTracker,
};

pub const TEXTURE_DATA_PLACEMENT_ALIGNMENT: u64 = 512;
pub const TEXTURE_DATA_PITCH_ALIGNMENT: u32 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    /// Nothing staged.
    Idle,
    /// Data has been staged since the last flush.
    Recording,
    /// The last flush has been submitted but not waited for.
    Submitted(u64),
}

/// A reserved region of the staging buffer.
///
/// Only valid until the staging buffer is next rewound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagingRegion {
    epoch: u64,
    offset: u64,
    size: u64,
}

impl StagingRegion {
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Clone, Copy, Debug)]
enum PendingCopy {
    Buffer {
        dst: ResourceId,
        dst_offset: u64,
        src_offset: u64,
        size: u64,
    },
    Texture {
        dst: ResourceId,
        subresource: u32,
        footprint: PlacedFootprint,
    },
}

#[derive(Clone, Copy, Debug)]
struct QueuedTransition {
    resource: ResourceId,
    subresource: Subresource,
    state: ResourceStates,
}

/// Replaces an earlier request for the same subresource, so that a resource
/// written several times per flush gets one barrier on each side.
fn queue_transition(queue: &mut Vec<QueuedTransition>, transition: QueuedTransition) {
    match queue.iter_mut().find(|queued| {
        queued.resource == transition.resource && queued.subresource == transition.subresource
    }) {
        Some(queued) => queued.state = transition.state,
        None => queue.push(transition),
    }
}

fn tracked(transitions: impl Iterator<Item = QueuedTransition>) -> ResourceStateTracker {
    let mut tracker = ResourceStateTracker::new();
    for transition in transitions {
        tracker.transition_resource(
            transition.resource,
            transition.state,
            transition.subresource,
            BarrierFlags::NONE,
        );
    }
    tracker
}

pub struct UploadHeap<B: Backend> {
    queue: Arc<B::Queue>,
    registry: Arc<ResourceStateRegistry>,
    allocator: LinearAllocator,
    // Declared after the allocator, which points into it.
    staging: B::UploadBuffer,
    pool: CommandListPool<B>,
    fence: FenceSync<B>,
    copies: Vec<PendingCopy>,
    pre_barriers: Vec<QueuedTransition>,
    post_barriers: Vec<QueuedTransition>,
    state: UploadState,
    /// Incremented every time the staging buffer is rewound.
    epoch: u64,
}

impl<B: Backend> UploadHeap<B> {
    pub fn new(
        device: &B::Device,
        queue: Arc<B::Queue>,
        registry: Arc<ResourceStateRegistry>,
        staging_size: u64,
    ) -> Result<Self> {
        if staging_size == 0 {
            return Err(Error::InvalidConfig("staging buffer size must be non-zero"));
        }

        let staging = device.create_upload_buffer(staging_size)?;
        // SAFETY: the mapping lives as long as `staging`, which the heap owns.
        let allocator = unsafe { LinearAllocator::new(staging.size(), staging.mapped_ptr()) };
        let pool = CommandListPool::new(device, queue.kind());

        Ok(Self {
            queue,
            registry,
            allocator,
            staging,
            pool,
            fence: FenceSync::new(device)?,
            copies: Vec::new(),
            pre_barriers: Vec::new(),
            post_barriers: Vec::new(),
            state: UploadState::Idle,
            epoch: 0,
        })
    }

    #[must_use]
    pub fn state(&self) -> UploadState {
        self.state
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.allocator.capacity()
    }

    #[must_use]
    pub fn bytes_staged(&self) -> u64 {
        self.allocator.bytes_allocated()
    }

    #[must_use]
    pub fn staging_buffer(&self) -> &B::UploadBuffer {
        &self.staging
    }

    /// Reserves `size` bytes of staging memory.
    ///
    /// If the request does not fit behind what is already staged, the staged
    /// uploads are flushed and waited for, and the request is retried once
    /// against the empty buffer.
    ///
    /// ## Returns
    ///
    /// `None` if the request is larger than the staging buffer. Nothing is
    /// flushed in that case.
    pub fn alloc_buffer(&mut self, size: u64, align: u64) -> Result<Option<StagingRegion>> {
        if size > self.allocator.capacity() {
            log::warn!(
                target: "gpu_state::upload",
                "staging request of {size} bytes exceeds the {} byte staging buffer",
                self.allocator.capacity()
            );
            return Ok(None);
        }

        if matches!(self.state, UploadState::Submitted(_)) {
            self.cpu_wait_for_upload_finished()?;
        }

        let first_try = self.allocator.allocate(size, align).map(|(offset, _)| offset);
        let offset = match first_try {
            Ok(offset) => offset,
            Err(error) => {
                log::debug!(
                    target: "gpu_state::upload",
                    "staging buffer full ({error}), flushing"
                );
                self.flush_and_finish()?;

                match self.allocator.allocate(size, align) {
                    Ok((offset, _)) => offset,
                    Err(error) => {
                        log::warn!(
                            target: "gpu_state::upload",
                            "staging request does not fit an empty staging buffer: {error}"
                        );
                        return Ok(None);
                    }
                }
            }
        };

        self.state = UploadState::Recording;
        Ok(Some(StagingRegion {
            epoch: self.epoch,
            offset,
            size,
        }))
    }

    /// The CPU-visible memory of `region`.
    ///
    /// ## Panics
    ///
    /// Panics if the staging buffer was rewound since `region` was reserved.
    pub fn staging_data_mut(&mut self, region: &StagingRegion) -> &mut [u8] {
        assert_eq!(region.epoch, self.epoch, "staging region used after a flush");
        unsafe {
            std::slice::from_raw_parts_mut(
                self.staging.mapped_ptr().as_ptr().add(region.offset as usize),
                region.size as usize,
            )
        }
    }

    pub fn add_buffer_copy(&mut self, dst: ResourceId, dst_offset: u64, region: &StagingRegion) {
        assert_eq!(region.epoch, self.epoch, "staging region used after a flush");
        self.copies.push(PendingCopy::Buffer {
            dst,
            dst_offset,
            src_offset: region.offset,
            size: region.size,
        });
    }

    /// Queues a copy into one texture subresource. The footprint's offset is
    /// taken from `region`.
    pub fn add_texture_copy(
        &mut self,
        dst: ResourceId,
        subresource: u32,
        region: &StagingRegion,
        footprint: PlacedFootprint,
    ) {
        assert_eq!(region.epoch, self.epoch, "staging region used after a flush");
        debug_assert_eq!(region.offset % TEXTURE_DATA_PLACEMENT_ALIGNMENT, 0);
        self.copies.push(PendingCopy::Texture {
            dst,
            subresource,
            footprint: PlacedFootprint {
                offset: region.offset,
                ..footprint
            },
        });
    }

    /// Queues a transition to execute before the copies of the next flush.
    pub fn add_pre_upload_barrier(
        &mut self,
        resource: ResourceId,
        state: ResourceStates,
        subresource: Subresource,
    ) {
        queue_transition(
            &mut self.pre_barriers,
            QueuedTransition {
                resource,
                subresource,
                state,
            },
        );
    }

    /// Queues a transition to execute after the copies of the next flush.
    pub fn add_post_upload_barrier(
        &mut self,
        resource: ResourceId,
        state: ResourceStates,
        subresource: Subresource,
    ) {
        queue_transition(
            &mut self.post_barriers,
            QueuedTransition {
                resource,
                subresource,
                state,
            },
        );
    }

    /// Stages `data` and queues its copy to `dst_offset` in `dst`, leaving
    /// `dst` in `final_state`.
    pub fn upload_buffer(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        data: &[u8],
        final_state: ResourceStates,
    ) -> Result<()> {
        let size = data.len() as u64;
        let region = self.alloc_buffer(size, 4)?.ok_or(Error::StagingTooSmall {
            requested: size,
            capacity: self.capacity(),
        })?;

        self.staging_data_mut(&region).copy_from_slice(data);
        self.add_pre_upload_barrier(dst, ResourceStates::COPY_DEST, Subresource::All);
        self.add_buffer_copy(dst, dst_offset, &region);
        self.add_post_upload_barrier(dst, final_state, Subresource::All);
        Ok(())
    }

    /// Stages one texture subresource laid out as `footprint` describes (rows
    /// `row_pitch` bytes apart) and queues its copy.
    pub fn upload_texture_subresource(
        &mut self,
        dst: ResourceId,
        subresource: u32,
        data: &[u8],
        footprint: PlacedFootprint,
        final_state: ResourceStates,
    ) -> Result<()> {
        debug_assert_eq!(footprint.row_pitch % TEXTURE_DATA_PITCH_ALIGNMENT, 0);

        let size = data.len() as u64;
        let region = self
            .alloc_buffer(size, TEXTURE_DATA_PLACEMENT_ALIGNMENT)?
            .ok_or(Error::StagingTooSmall {
                requested: size,
                capacity: self.capacity(),
            })?;

        self.staging_data_mut(&region).copy_from_slice(data);
        let target = Subresource::Index(subresource);
        self.add_pre_upload_barrier(dst, ResourceStates::COPY_DEST, target);
        self.add_texture_copy(dst, subresource, &region, footprint);
        self.add_post_upload_barrier(dst, final_state, target);
        Ok(())
    }

    /// Records and submits everything queued since the last flush. Does not
    /// wait for the GPU.
    ///
    /// The registry stays locked from barrier resolution until the new states
    /// are committed after submission.
    ///
    /// ## Returns
    ///
    /// The fence value of the submission, or `None` if nothing was queued.
    pub fn do_upload(&mut self) -> Result<Option<u64>> {
        if self.copies.is_empty() && self.pre_barriers.is_empty() && self.post_barriers.is_empty()
        {
            if self.state == UploadState::Recording {
                self.rewind();
            }
            return Ok(None);
        }

        let mut buffer = self.pool.acquire(&self.fence)?;
        let mut resolver = BatchResolver::new(self.registry.lock());
        let mut pre = tracked(self.pre_barriers.drain(..));
        let pre_barriers = resolver.resolve(&mut pre);
        // Resolved against the states the pre-upload barriers leave behind.
        let mut post = tracked(self.post_barriers.drain(..));
        let post_barriers = resolver.resolve(&mut post);

        let copy_count = self.copies.len();
        let list = buffer.list_mut();
        if !pre_barriers.is_empty() {
            list.resource_barrier(&pre_barriers);
        }
        pre.flush_resource_barriers::<B>(list);

        for copy in self.copies.drain(..) {
            match copy {
                PendingCopy::Buffer {
                    dst,
                    dst_offset,
                    src_offset,
                    size,
                } => list.copy_buffer_region(dst, dst_offset, &self.staging, src_offset, size),
                PendingCopy::Texture {
                    dst,
                    subresource,
                    footprint,
                } => list.copy_texture_region(dst, subresource, &self.staging, &footprint),
            }
        }

        if !post_barriers.is_empty() {
            list.resource_barrier(&post_barriers);
        }
        post.flush_resource_barriers::<B>(list);

        let value = self.pool.submit(&self.queue, &mut self.fence, buffer)?;
        resolver.commit();

        log::trace!(
            target: "gpu_state::upload",
            "submitted {copy_count} copies ({} bytes staged) as fence value {value}",
            self.allocator.bytes_allocated()
        );

        self.state = UploadState::Submitted(value);
        Ok(Some(value))
    }

    /// Blocks until the last flush has executed and rewinds the staging
    /// buffer.
    pub fn cpu_wait_for_upload_finished(&mut self) -> Result<()> {
        if let UploadState::Submitted(value) = self.state {
            self.fence.cpu_wait(value)?;
            self.rewind();
        }
        Ok(())
    }

    /// [`Self::do_upload`] followed by [`Self::cpu_wait_for_upload_finished`].
    pub fn flush_and_finish(&mut self) -> Result<()> {
        self.do_upload()?;
        self.cpu_wait_for_upload_finished()
    }

    /// Whether the GPU has finished the last flush.
    #[must_use]
    pub fn is_upload_finished(&self) -> bool {
        match self.state {
            UploadState::Submitted(value) => self.fence.is_complete(value),
            UploadState::Idle | UploadState::Recording => true,
        }
    }

    fn rewind(&mut self) {
        self.allocator.clear();
        self.epoch += 1;
        self.state = UploadState::Idle;
    }
}

impl<B: Backend> Drop for UploadHeap<B> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert!(
            self.state != UploadState::Recording
                && self.copies.is_empty()
                && self.pre_barriers.is_empty()
                && self.post_barriers.is_empty(),
            "upload heap dropped with uploads that were never flushed"
        );

        if let Err(error) = self.cpu_wait_for_upload_finished() {
            log::error!(target: "gpu_state::upload", "failed to wait for the last upload: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{self, Command, Headless};
    use crate::state::{Barrier, ResourceState};

    struct Fixture {
        device: headless::Device,
        queue: Arc<headless::Queue>,
        registry: Arc<ResourceStateRegistry>,
        heap: UploadHeap<Headless>,
    }

    fn fixture(staging_size: u64) -> Fixture {
        let device = headless::Device::new();
        let queue = Arc::new(device.create_queue(crate::backend::QueueKind::Copy).unwrap());
        let registry = Arc::new(ResourceStateRegistry::new());
        let heap =
            UploadHeap::<Headless>::new(&device, queue.clone(), registry.clone(), staging_size)
                .unwrap();
        Fixture {
            device,
            queue,
            registry,
            heap,
        }
    }

    #[test]
    fn upload_buffer_round_trip() {
        let mut f = fixture(4096);
        let dst = f.device.create_resource();
        f.registry.set_resource_state(dst, ResourceStates::COMMON);

        f.heap
            .upload_buffer(dst, 64, &[1, 2, 3, 4], ResourceStates::PIXEL_SHADER_RESOURCE)
            .unwrap();
        assert_eq!(f.heap.state(), UploadState::Recording);
        f.heap.flush_and_finish().unwrap();
        assert_eq!(f.heap.state(), UploadState::Idle);
        assert_eq!(f.heap.bytes_staged(), 0);

        let executions = f.device.executions();
        assert_eq!(executions.len(), 1);
        let commands = &executions[0].lists[0];

        // COMMON -> COPY_DEST is an implicit promotion
        assert!(matches!(
            &commands[0],
            Command::CopyBuffer { dst: d, dst_offset: 64, data, .. } if *d == dst && data == &[1, 2, 3, 4]
        ));
        assert_eq!(
            commands[1],
            Command::Barriers(vec![Barrier::transition(
                dst,
                Subresource::All,
                ResourceStates::COPY_DEST,
                ResourceStates::PIXEL_SHADER_RESOURCE
            )])
        );

        assert_eq!(
            f.registry.find_resource_state(dst),
            Some(ResourceState::new(ResourceStates::PIXEL_SHADER_RESOURCE))
        );
    }

    #[test]
    fn explicit_pre_barrier_when_not_common() {
        let mut f = fixture(4096);
        let dst = f.device.create_resource();
        f.registry
            .set_resource_state(dst, ResourceStates::VERTEX_AND_CONSTANT_BUFFER);

        f.heap
            .upload_buffer(dst, 0, &[0; 16], ResourceStates::VERTEX_AND_CONSTANT_BUFFER)
            .unwrap();
        f.heap
            .upload_buffer(dst, 16, &[0; 16], ResourceStates::VERTEX_AND_CONSTANT_BUFFER)
            .unwrap();
        f.heap.flush_and_finish().unwrap();

        assert_eq!(
            f.device.executed_barriers(),
            [
                Barrier::transition(
                    dst,
                    Subresource::All,
                    ResourceStates::VERTEX_AND_CONSTANT_BUFFER,
                    ResourceStates::COPY_DEST
                ),
                Barrier::transition(
                    dst,
                    Subresource::All,
                    ResourceStates::COPY_DEST,
                    ResourceStates::VERTEX_AND_CONSTANT_BUFFER
                ),
            ]
        );
    }

    #[test]
    fn post_barrier_alone_runs_after_the_copy() {
        let mut f = fixture(1024);
        let dst = f.device.create_resource();
        f.registry.set_resource_state(dst, ResourceStates::COPY_DEST);

        let region = f.heap.alloc_buffer(16, 4).unwrap().unwrap();
        f.heap.add_buffer_copy(dst, 0, &region);
        f.heap
            .add_post_upload_barrier(dst, ResourceStates::PIXEL_SHADER_RESOURCE, Subresource::All);
        f.heap.flush_and_finish().unwrap();

        let executions = f.device.executions();
        let commands = &executions[0].lists[0];
        assert_eq!(commands.len(), 2);
        assert!(matches!(&commands[0], Command::CopyBuffer { dst: d, .. } if *d == dst));
        assert_eq!(
            commands[1],
            Command::Barriers(vec![Barrier::transition(
                dst,
                Subresource::All,
                ResourceStates::COPY_DEST,
                ResourceStates::PIXEL_SHADER_RESOURCE
            )])
        );
        assert_eq!(
            f.registry.find_resource_state(dst),
            Some(ResourceState::new(ResourceStates::PIXEL_SHADER_RESOURCE))
        );
    }

    #[test]
    fn post_barriers_follow_pre_barriers_of_other_resources() {
        let mut f = fixture(1024);
        let texture = f.device.create_resource();
        let buffer = f.device.create_resource();
        f.registry
            .set_resource_state(texture, ResourceStates::PIXEL_SHADER_RESOURCE);
        f.registry.set_resource_state(buffer, ResourceStates::COPY_DEST);

        let region = f.heap.alloc_buffer(16, 4).unwrap().unwrap();
        f.heap
            .add_pre_upload_barrier(texture, ResourceStates::COPY_DEST, Subresource::All);
        f.heap.add_buffer_copy(buffer, 0, &region);
        f.heap
            .add_post_upload_barrier(buffer, ResourceStates::INDEX_BUFFER, Subresource::All);
        f.heap
            .add_post_upload_barrier(texture, ResourceStates::PIXEL_SHADER_RESOURCE, Subresource::All);
        f.heap.flush_and_finish().unwrap();

        let executions = f.device.executions();
        let commands = &executions[0].lists[0];
        assert_eq!(commands.len(), 3);
        assert_eq!(
            commands[0],
            Command::Barriers(vec![Barrier::transition(
                texture,
                Subresource::All,
                ResourceStates::PIXEL_SHADER_RESOURCE,
                ResourceStates::COPY_DEST
            )])
        );
        assert!(matches!(commands[1], Command::CopyBuffer { .. }));
        assert_eq!(
            commands[2],
            Command::Barriers(vec![
                Barrier::transition(
                    buffer,
                    Subresource::All,
                    ResourceStates::COPY_DEST,
                    ResourceStates::INDEX_BUFFER
                ),
                Barrier::transition(
                    texture,
                    Subresource::All,
                    ResourceStates::COPY_DEST,
                    ResourceStates::PIXEL_SHADER_RESOURCE
                ),
            ])
        );
    }

    #[test]
    fn copy_only_upload_decays_to_common() {
        let mut f = fixture(1024);
        let dst = f.device.create_resource();
        f.registry.set_resource_state(dst, ResourceStates::COMMON);

        let region = f.heap.alloc_buffer(8, 4).unwrap().unwrap();
        f.heap.staging_data_mut(&region).fill(7);
        f.heap
            .add_pre_upload_barrier(dst, ResourceStates::COPY_DEST, Subresource::All);
        f.heap.add_buffer_copy(dst, 0, &region);
        f.heap.flush_and_finish().unwrap();

        assert!(f.device.executed_barriers().is_empty());
        assert_eq!(
            f.registry.find_resource_state(dst),
            Some(ResourceState::new(ResourceStates::COMMON))
        );
    }

    #[test]
    fn overflow_flushes_then_retries() {
        let mut f = fixture(4096);
        let dst = f.device.create_resource();
        f.registry.set_resource_state(dst, ResourceStates::COMMON);

        let first = f.heap.alloc_buffer(3000, 4).unwrap().unwrap();
        f.heap.add_buffer_copy(dst, 0, &first);
        assert!(f.device.executions().is_empty());

        let second = f.heap.alloc_buffer(2000, 4).unwrap().unwrap();
        assert_eq!(second.offset(), 0);
        assert_eq!(f.device.executions().len(), 1);
        assert_eq!(f.heap.state(), UploadState::Recording);

        // larger than the staging buffer: refused without flushing
        assert_eq!(f.heap.alloc_buffer(5000, 4).unwrap(), None);
        assert_eq!(f.device.executions().len(), 1);
        assert_eq!(f.heap.bytes_staged(), 2000);

        // exactly the capacity fits after a flush
        let full = f.heap.alloc_buffer(4096, 4).unwrap().unwrap();
        assert_eq!(full.offset(), 0);

        f.heap.add_buffer_copy(dst, 0, &full);
        f.heap.flush_and_finish().unwrap();
    }

    #[test]
    fn oversized_upload_is_an_error() {
        let mut f = fixture(256);
        let dst = f.device.create_resource();
        assert!(matches!(
            f.heap.upload_buffer(dst, 0, &[0; 512], ResourceStates::COMMON),
            Err(Error::StagingTooSmall {
                requested: 512,
                capacity: 256
            })
        ));
    }

    #[test]
    fn texture_subresource_upload() {
        let mut f = fixture(64 * 1024);
        let texture = f.device.create_resource();
        f.registry.set_resource_state(texture, ResourceStates::COMMON);

        // move the cursor off zero to check placement alignment
        let region = f.heap.alloc_buffer(10, 4).unwrap().unwrap();
        f.heap.add_buffer_copy(f.device.create_resource(), 0, &region);

        let footprint = PlacedFootprint {
            offset: 0,
            format: 28, // R8G8B8A8_UNORM
            width: 64,
            height: 4,
            depth: 1,
            row_pitch: 256,
        };
        f.heap
            .upload_texture_subresource(
                texture,
                2,
                &[0xab; 1024],
                footprint,
                ResourceStates::PIXEL_SHADER_RESOURCE,
            )
            .unwrap();
        f.heap.flush_and_finish().unwrap();

        let executions = f.device.executions();
        let copy = executions[0].lists[0]
            .iter()
            .find_map(|command| match command {
                Command::CopyTexture {
                    subresource,
                    footprint,
                    ..
                } => Some((*subresource, *footprint)),
                _ => None,
            })
            .unwrap();
        assert_eq!(copy.0, 2);
        assert_eq!(copy.1.offset, TEXTURE_DATA_PLACEMENT_ALIGNMENT);

        let state = f.registry.find_resource_state(texture).unwrap();
        assert_eq!(
            state.get(Subresource::Index(2)),
            ResourceStates::PIXEL_SHADER_RESOURCE
        );
        assert_eq!(state.get(Subresource::Index(0)), ResourceStates::COMMON);
    }

    #[test]
    fn submission_is_not_waited_for() {
        let mut f = fixture(1024);
        let dst = f.device.create_resource();
        f.registry.set_resource_state(dst, ResourceStates::COPY_DEST);

        f.queue.hold();
        f.heap
            .upload_buffer(dst, 0, &[9; 32], ResourceStates::COPY_DEST)
            .unwrap();
        let value = f.heap.do_upload().unwrap().unwrap();

        assert_eq!(f.heap.state(), UploadState::Submitted(value));
        assert!(!f.heap.is_upload_finished());

        f.queue.release();
        assert!(f.heap.is_upload_finished());
        f.heap.cpu_wait_for_upload_finished().unwrap();
        assert_eq!(f.heap.state(), UploadState::Idle);
    }

    #[test]
    #[should_panic(expected = "after a flush")]
    fn stale_region() {
        let mut f = fixture(1024);
        let region = f.heap.alloc_buffer(16, 4).unwrap().unwrap();
        f.heap.do_upload().unwrap();
        f.heap.staging_data_mut(&region);
    }

    #[test]
    #[should_panic(expected = "never flushed")]
    fn dropped_with_queued_uploads() {
        let mut f = fixture(1024);
        let dst = f.device.create_resource();
        f.heap.upload_buffer(dst, 0, &[1], ResourceStates::COMMON).unwrap();
        drop(f);
    }
}
