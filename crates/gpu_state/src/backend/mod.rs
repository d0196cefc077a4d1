//! The native API seam.
//!
//! Everything above this module is API-agnostic bookkeeping. A backend only
//! has to create objects, record barriers and copies, and submit/signal/wait.

use std::ptr::NonNull;

use crate::{
    error::Result,
    state::{Barrier, ResourceId},
};

#[cfg(target_os = "windows")]
pub mod dx12;

pub mod headless;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Copy,
}

impl QueueKind {
    pub const COUNT: usize = 3;
    pub const ALL: [Self; Self::COUNT] = [Self::Graphics, Self::Compute, Self::Copy];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
            Self::Copy => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

impl DescriptorHeapKind {
    pub const COUNT: usize = 4;
    pub const ALL: [Self; Self::COUNT] = [Self::CbvSrvUav, Self::Sampler, Self::Rtv, Self::Dsv];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::CbvSrvUav => 0,
            Self::Sampler => 1,
            Self::Rtv => 2,
            Self::Dsv => 3,
        }
    }
}

/// CPU address of a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuDescriptorHandle(pub usize);

impl CpuDescriptorHandle {
    #[must_use]
    pub fn offset(self, index: u32, increment_size: u32) -> Self {
        Self(self.0 + index as usize * increment_size as usize)
    }
}

/// Layout of one texture subresource inside an upload buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlacedFootprint {
    /// Byte offset of the first texel in the upload buffer.
    pub offset: u64,
    /// A `DXGI_FORMAT` value.
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub row_pitch: u32,
}

/// Bundles the object types of one native API.
pub trait Backend: Sized + 'static {
    type Device: Device<Self>;
    type Queue: Queue<Self>;
    type Fence: Fence;
    type CommandAllocator: CommandAllocator;
    type CommandList: CommandList<Self>;
    type DescriptorHeap: DescriptorHeap;
    type UploadBuffer: UploadBuffer;
}

pub trait Device<B: Backend>: Clone + Send + Sync {
    fn create_queue(&self, kind: QueueKind) -> Result<B::Queue>;

    fn create_fence(&self, initial_value: u64) -> Result<B::Fence>;

    fn create_command_allocator(&self, kind: QueueKind) -> Result<B::CommandAllocator>;

    /// Creates a command list that is open for recording into `allocator`.
    fn create_command_list(
        &self,
        kind: QueueKind,
        allocator: &B::CommandAllocator,
    ) -> Result<B::CommandList>;

    /// Creates a CPU-only descriptor heap.
    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<B::DescriptorHeap>;

    /// Creates a persistently mapped buffer in CPU-write, GPU-read memory.
    fn create_upload_buffer(&self, size: u64) -> Result<B::UploadBuffer>;
}

pub trait Queue<B: Backend>: Send + Sync {
    fn kind(&self) -> QueueKind;

    /// Submits closed command lists, in order, as a single batch.
    fn execute_command_lists(&self, lists: &[&B::CommandList]) -> Result<()>;

    /// Sets `fence` to `value` once all previously submitted work completes.
    fn signal(&self, fence: &B::Fence, value: u64) -> Result<()>;

    /// Makes the queue wait on the GPU until `fence` reaches `value`. Does not
    /// block the calling thread.
    fn wait(&self, fence: &B::Fence, value: u64) -> Result<()>;
}

pub trait Fence: Send + Sync {
    fn completed_value(&self) -> u64;

    /// Blocks the calling thread until the fence reaches `value`. There is no
    /// timeout.
    fn wait_for_value(&self, value: u64) -> Result<()>;
}

pub trait CommandAllocator: Send {
    /// Reclaims the memory of every command list recorded into the allocator.
    /// The GPU must be done with all of them.
    fn reset(&self) -> Result<()>;
}

pub trait CommandList<B: Backend>: Send {
    fn kind(&self) -> QueueKind;

    /// Reopens a closed list for recording into `allocator`.
    fn reset(&mut self, allocator: &B::CommandAllocator) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn resource_barrier(&mut self, barriers: &[Barrier]);

    fn copy_buffer_region(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        src: &B::UploadBuffer,
        src_offset: u64,
        size: u64,
    );

    fn copy_texture_region(
        &mut self,
        dst: ResourceId,
        subresource: u32,
        src: &B::UploadBuffer,
        footprint: &PlacedFootprint,
    );
}

pub trait DescriptorHeap: Send + Sync {
    fn kind(&self) -> DescriptorHeapKind;

    fn capacity(&self) -> u32;

    fn cpu_start(&self) -> CpuDescriptorHandle;

    fn increment_size(&self) -> u32;
}

pub trait UploadBuffer: Send + Sync {
    fn resource(&self) -> ResourceId;

    fn size(&self) -> u64;

    /// Start of the CPU mapping. Valid for `size()` bytes for the lifetime of
    /// the buffer.
    fn mapped_ptr(&self) -> NonNull<u8>;

    fn gpu_address(&self) -> u64;
}
