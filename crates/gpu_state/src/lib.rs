//! Resource state tracking and frame-pipelined GPU memory management.
//!
//! Command lists are recorded in [`Context`]s, on any thread, without knowing
//! the order in which they will be submitted. Each context tracks the state
//! it leaves its resources in; the transitions it cannot resolve locally are
//! reconciled against a shared [`ResourceStateRegistry`] when a batch of
//! contexts is executed.
//!
//! Around that sit the allocators whose memory the GPU reads after the CPU
//! has moved on: descriptor pages with deferred reuse, per-frame dynamic
//! upload buffers and a staging heap for copies into default-heap resources.
//! Their reuse is gated on fences rather than on CPU-side ownership.
//!
//! ## Goals
//!
//! - [x] Multi-threaded command recording
//! - [x] Correct barriers regardless of submission order
//! - [x] No per-frame allocation once warmed up
//!
//! ## Non-goals
//!
//! - [ ] Cross-queue synchronization
//! - [ ] Shader-visible descriptor heaps

pub mod backend;
pub mod command;
pub mod context;
pub mod error;
pub mod fence;
pub mod frame;
pub mod memory;
pub mod registry;
pub mod resolve;
pub mod state;
pub mod tracker;
pub mod upload;

use std::sync::Arc;

pub use crate::{
    backend::{Backend, DescriptorHeapKind, QueueKind},
    context::Context,
    error::{Error, Result},
    fence::SubmissionId,
    frame::FrameResource,
    memory::{
        descriptor::DescriptorHandle, descriptor_allocator::DescriptorAllocator,
        dynamic_buffer::DynamicBufferAllocator,
    },
    registry::ResourceStateRegistry,
    state::{Barrier, BarrierFlags, ResourceId, ResourceState, ResourceStates, Subresource},
    tracker::ResourceStateTracker,
    upload::UploadHeap,
};

use crate::backend::Device;

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct Config {
    /// The number of frames the CPU may record ahead of the GPU.
    ///
    /// Every frame in flight keeps its own command buffers and dynamic upload
    /// memory. Defaults to 3.
    pub frames_in_flight: usize,

    /// The number of graphics command buffers created up front for each
    /// frame. More are created on demand. Defaults to 8.
    pub command_lists_per_frame: usize,

    /// The number of descriptors in each descriptor page, indexed by
    /// [`DescriptorHeapKind::index`].
    ///
    /// Defaults to 4096 for CBV/SRV/UAV and 256 for the others.
    pub descriptor_page_sizes: [u32; DescriptorHeapKind::COUNT],

    /// The size of the first dynamic upload block of each frame.
    ///
    /// Defaults to 1 Mib.
    pub dynamic_buffer_block_size: u64,

    /// The amount of memory to allocate for staging copies to GPU-local
    /// resources.
    ///
    /// Defaults to 4 Mib.
    pub staging_buffer_size: u64,

    /// The queue that executes staging copies. Defaults to `Copy`.
    pub upload_queue: QueueKind,

    /// Whether or not to enable debugging features.
    ///
    /// This may have an outsized impact on performance. Defaults to `None`,
    /// which automatically enables debugging features in debug builds. Override
    /// with `Some(true)` or `Some(false)` to force enable or disable debugging.
    ///
    /// Read by the native device when it is created, before the context:
    ///
    /// ```ignore
    /// let config = Config::default();
    /// let device = gpu_state::backend::dx12::Device::new(&config)?;
    /// let gpu = GraphicsContext::<Dx12>::new(device, &config)?;
    /// ```
    pub debug_mode: Option<bool>,
}

impl Config {
    #[must_use]
    pub fn debug_enabled(&self) -> bool {
        self.debug_mode.unwrap_or(cfg!(debug_assertions))
    }

    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(Error::InvalidConfig("frames_in_flight must be at least 1"));
        }
        if self.descriptor_page_sizes.contains(&0) {
            return Err(Error::InvalidConfig("descriptor pages must not be empty"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            command_lists_per_frame: 8,
            descriptor_page_sizes: [4096, 256, 256, 256],
            dynamic_buffer_block_size: MIB,
            staging_buffer_size: 4 * MIB,
            upload_queue: QueueKind::Copy,
            debug_mode: None,
        }
    }
}

/// Shared GPU state: the resource registry, the descriptor allocator, the
/// upload heap and the per-frame command machinery, all created on one queue
/// of each kind.
pub struct GraphicsContext<B: Backend> {
    device: B::Device,
    registry: Arc<ResourceStateRegistry>,
    descriptors: DescriptorAllocator<B>,
    // Dropped before `frame`, so that its own wait runs while the queues are
    // still alive.
    upload: UploadHeap<B>,
    frame: FrameResource<B>,
}

impl<B: Backend> GraphicsContext<B> {
    pub fn new(device: B::Device, config: &Config) -> Result<Self> {
        config.validate()?;

        let mut queues = Vec::with_capacity(QueueKind::COUNT);
        for kind in QueueKind::ALL {
            queues.push(Arc::new(device.create_queue(kind)?));
        }

        let registry = Arc::new(ResourceStateRegistry::new());
        let descriptors = DescriptorAllocator::new(&device, config.descriptor_page_sizes)?;
        let upload = UploadHeap::new(
            &device,
            queues[config.upload_queue.index()].clone(),
            registry.clone(),
            config.staging_buffer_size,
        )?;
        let frame = FrameResource::new(&device, registry.clone(), queues, config)?;

        log::info!(
            target: "gpu_state",
            "created graphics context with {} frames in flight, uploads on the {:?} queue (debug: {})",
            config.frames_in_flight,
            config.upload_queue,
            config.debug_enabled()
        );

        Ok(Self {
            device,
            registry,
            descriptors,
            upload,
            frame,
        })
    }

    #[must_use]
    pub fn device(&self) -> &B::Device {
        &self.device
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ResourceStateRegistry> {
        &self.registry
    }

    /// Starts tracking `resource`, which is currently in `state`.
    pub fn register_resource(&self, resource: ResourceId, state: ResourceStates) {
        self.registry.set_resource_state(resource, state);
    }

    /// Stops tracking `resource`. Must be called before the resource is
    /// destroyed, as the identity may be reused.
    pub fn unregister_resource(&self, resource: ResourceId) -> Option<ResourceState> {
        self.registry.remove_resource_state(resource)
    }

    /// Waits for the GPU to be done with the current frame slot, recycles
    /// its memory and releases descriptors freed since its last use.
    pub fn begin_frame(&mut self) -> Result<()> {
        self.frame.begin_frame()?;
        self.descriptors.release_stale_descriptors();
        Ok(())
    }

    pub fn end_frame(&mut self) {
        self.frame.end_frame();
    }

    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.frame.frame_number()
    }

    pub fn create_context(&mut self, kind: QueueKind) -> Result<Context<B>> {
        self.frame.create_context(kind)
    }

    /// See [`FrameResource::execute_contexts`].
    pub fn execute_contexts(&mut self, contexts: Vec<Context<B>>) -> Result<SubmissionId> {
        self.frame.execute_contexts(contexts)
    }

    pub fn allocate_descriptors(
        &self,
        kind: DescriptorHeapKind,
        count: u32,
    ) -> Result<DescriptorHandle<B>> {
        self.descriptors.allocate(kind, count)
    }

    /// Makes descriptors freed so far reusable. Called by
    /// [`Self::begin_frame`]; only call it directly once the GPU is idle.
    pub fn release_stale_descriptors(&self) {
        self.descriptors.release_stale_descriptors();
    }

    #[must_use]
    pub fn descriptors(&self) -> &DescriptorAllocator<B> {
        &self.descriptors
    }

    pub fn upload_heap(&mut self) -> &mut UploadHeap<B> {
        &mut self.upload
    }

    pub fn dynamic_buffers(&mut self) -> &mut DynamicBufferAllocator<B> {
        self.frame.dynamic_buffers()
    }

    #[must_use]
    pub fn is_complete(&self, submission: SubmissionId) -> bool {
        self.frame.is_complete(submission)
    }

    pub fn wait(&self, submission: SubmissionId) -> Result<()> {
        self.frame.wait(submission)
    }

    /// Blocks until every queue is idle, including pending uploads.
    pub fn wait_idle(&mut self) -> Result<()> {
        self.upload.cpu_wait_for_upload_finished()?;
        self.frame.wait_idle()
    }
}

impl<B: Backend> Drop for GraphicsContext<B> {
    fn drop(&mut self) {
        if let Err(error) = self.wait_idle() {
            log::error!(target: "gpu_state", "failed to idle the GPU on shutdown: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{self, Command, Headless};

    fn context(device: &headless::Device) -> GraphicsContext<Headless> {
        let config = Config {
            frames_in_flight: 2,
            command_lists_per_frame: 2,
            descriptor_page_sizes: [64, 16, 16, 16],
            dynamic_buffer_block_size: 4096,
            staging_buffer_size: 4096,
            ..Config::default()
        };
        GraphicsContext::new(device.clone(), &config).unwrap()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.descriptor_page_sizes[DescriptorHeapKind::CbvSrvUav.index()], 4096);
        assert_eq!(config.staging_buffer_size, 4 * MIB);
        assert!(config.validate().is_ok());
        assert_eq!(config.debug_enabled(), cfg!(debug_assertions));
        assert!(Config {
            debug_mode: Some(true),
            ..Config::default()
        }
        .debug_enabled());
    }

    #[test]
    fn rejects_zero_frames() {
        let config = Config {
            frames_in_flight: 0,
            ..Config::default()
        };
        assert!(matches!(
            GraphicsContext::<Headless>::new(headless::Device::new(), &config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn upload_then_render() {
        let device = headless::Device::new();
        let mut gpu = context(&device);
        let buffer = device.create_resource();
        gpu.register_resource(buffer, ResourceStates::COMMON);

        gpu.upload_heap()
            .upload_buffer(buffer, 0, &[1, 2, 3, 4], ResourceStates::VERTEX_AND_CONSTANT_BUFFER)
            .unwrap();
        gpu.upload_heap().flush_and_finish().unwrap();

        let uploads = device.take_executions();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].queue, QueueKind::Copy);
        // COMMON -> COPY_DEST is an implicit promotion
        assert!(matches!(
            uploads[0].lists[0].as_slice(),
            [Command::CopyBuffer { data, .. }, Command::Barriers(_)] if data == &[1, 2, 3, 4]
        ));
        assert_eq!(
            gpu.registry().find_resource_state(buffer).map(|s| s.whole()),
            Some(ResourceStates::VERTEX_AND_CONSTANT_BUFFER)
        );

        gpu.begin_frame().unwrap();
        let mut ctx = gpu.create_context(QueueKind::Graphics).unwrap();
        ctx.transition(buffer, ResourceStates::COPY_SOURCE);
        let submission = gpu.execute_contexts(vec![ctx]).unwrap();
        gpu.end_frame();
        gpu.wait(submission).unwrap();
        assert!(gpu.is_complete(submission));

        assert_eq!(
            device.executed_barriers(),
            [Barrier::transition(
                buffer,
                Subresource::All,
                ResourceStates::VERTEX_AND_CONSTANT_BUFFER,
                ResourceStates::COPY_SOURCE,
            )]
        );
        assert_eq!(gpu.frame_number(), 1);
    }

    #[test]
    fn descriptors_are_reused_after_a_frame() {
        let device = headless::Device::new();
        let mut gpu = context(&device);

        let handle = gpu.allocate_descriptors(DescriptorHeapKind::CbvSrvUav, 64).unwrap();
        let first = handle.cpu_handle(0);
        drop(handle);

        // not reusable until the frame fence has passed
        gpu.allocate_descriptors(DescriptorHeapKind::CbvSrvUav, 64).unwrap();
        assert_eq!(gpu.descriptors().page_count(DescriptorHeapKind::CbvSrvUav), 2);

        gpu.begin_frame().unwrap();
        let again = gpu.allocate_descriptors(DescriptorHeapKind::CbvSrvUav, 64).unwrap();
        assert_eq!(again.cpu_handle(0), first);
    }

    #[test]
    fn unregistered_resources_are_forgotten() {
        let device = headless::Device::new();
        let gpu = context(&device);
        let texture = device.create_resource();

        gpu.register_resource(texture, ResourceStates::RENDER_TARGET);
        assert_eq!(
            gpu.unregister_resource(texture).map(|s| s.whole()),
            Some(ResourceStates::RENDER_TARGET)
        );
        assert!(gpu.registry().find_resource_state(texture).is_none());
    }
}
