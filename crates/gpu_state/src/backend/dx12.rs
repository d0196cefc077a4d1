//! Direct3D 12 backend.
//!
//! A [`ResourceId`] is the address of the `ID3D12Resource` it names. The
//! registry does not hold a reference to the resource, so the owner must
//! unregister it before releasing the last reference.

use std::{ffi::c_void, mem::ManuallyDrop, ptr::NonNull, sync::Arc};

use parking_lot::Mutex;
use smallvec::SmallVec;
#[allow(clippy::wildcard_imports)]
use windows::{
    core::{ComInterface, Interface, PCSTR},
    Win32::{
        Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0},
        Graphics::{
            Direct3D::D3D_FEATURE_LEVEL_11_0,
            Direct3D12::*,
            Dxgi::{
                Common::{DXGI_FORMAT, DXGI_FORMAT_UNKNOWN, DXGI_SAMPLE_DESC},
                CreateDXGIFactory2, IDXGIAdapter, IDXGIFactory6, DXGI_CREATE_FACTORY_DEBUG,
                DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE,
            },
        },
        System::Threading::{CreateEventW, WaitForSingleObject},
    },
};

use super::{Backend, CpuDescriptorHandle, DescriptorHeapKind, PlacedFootprint, QueueKind};
use crate::{
    error::{Error, Result},
    state::{Barrier, ResourceId, Subresource},
    Config,
};

pub enum Dx12 {}

impl Backend for Dx12 {
    type Device = Device;
    type Queue = Queue;
    type Fence = Fence;
    type CommandAllocator = CommandAllocator;
    type CommandList = CommandList;
    type DescriptorHeap = DescriptorHeap;
    type UploadBuffer = UploadBuffer;
}

fn check<T>(call: &'static str, result: windows::core::Result<T>) -> Result<T> {
    result.map_err(|error| Error::device(call, error))
}

/// The identity of `resource` for registration.
#[must_use]
pub fn resource_id(resource: &ID3D12Resource) -> ResourceId {
    // COM pointers are never null.
    ResourceId::new(resource.as_raw() as usize).unwrap_or_else(|| unreachable!())
}

/// Reinterprets `resource` as an interface pointer without taking a
/// reference. The result must not be dropped.
unsafe fn borrow_resource(resource: ResourceId) -> ManuallyDrop<ID3D12Resource> {
    ManuallyDrop::new(std::mem::transmute_copy(&resource.raw()))
}

/// [`borrow_resource`] in the form barrier and copy descriptions take.
unsafe fn resource_field(resource: ResourceId) -> ManuallyDrop<Option<ID3D12Resource>> {
    ManuallyDrop::new(Some(ManuallyDrop::into_inner(borrow_resource(resource))))
}

fn list_type(kind: QueueKind) -> D3D12_COMMAND_LIST_TYPE {
    match kind {
        QueueKind::Graphics => D3D12_COMMAND_LIST_TYPE_DIRECT,
        QueueKind::Compute => D3D12_COMMAND_LIST_TYPE_COMPUTE,
        QueueKind::Copy => D3D12_COMMAND_LIST_TYPE_COPY,
    }
}

fn heap_type(kind: DescriptorHeapKind) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match kind {
        DescriptorHeapKind::CbvSrvUav => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        DescriptorHeapKind::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
        DescriptorHeapKind::Rtv => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        DescriptorHeapKind::Dsv => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}

fn native_barrier(barrier: &Barrier) -> D3D12_RESOURCE_BARRIER {
    match barrier {
        Barrier::Transition(transition) => D3D12_RESOURCE_BARRIER {
            Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
            Flags: D3D12_RESOURCE_BARRIER_FLAGS(transition.flags.bits() as i32),
            Anonymous: D3D12_RESOURCE_BARRIER_0 {
                Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                    pResource: unsafe { resource_field(transition.resource) },
                    StateBefore: D3D12_RESOURCE_STATES(transition.before.bits() as i32),
                    StateAfter: D3D12_RESOURCE_STATES(transition.after.bits() as i32),
                    Subresource: match transition.subresource {
                        Subresource::All => D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                        Subresource::Index(index) => index,
                    },
                }),
            },
        },
        Barrier::UnorderedAccess(resource) => D3D12_RESOURCE_BARRIER {
            Type: D3D12_RESOURCE_BARRIER_TYPE_UAV,
            Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
            Anonymous: D3D12_RESOURCE_BARRIER_0 {
                UAV: ManuallyDrop::new(D3D12_RESOURCE_UAV_BARRIER {
                    pResource: match resource {
                        Some(resource) => unsafe { resource_field(*resource) },
                        None => ManuallyDrop::new(None),
                    },
                }),
            },
        },
        Barrier::Aliasing { before, after } => {
            let borrow = |resource: &Option<ResourceId>| match resource {
                Some(resource) => unsafe { resource_field(*resource) },
                None => ManuallyDrop::new(None),
            };
            D3D12_RESOURCE_BARRIER {
                Type: D3D12_RESOURCE_BARRIER_TYPE_ALIASING,
                Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
                Anonymous: D3D12_RESOURCE_BARRIER_0 {
                    Aliasing: ManuallyDrop::new(D3D12_RESOURCE_ALIASING_BARRIER {
                        pResourceBefore: borrow(before),
                        pResourceAfter: borrow(after),
                    }),
                },
            }
        }
    }
}

extern "system" fn debug_callback(
    _category: D3D12_MESSAGE_CATEGORY,
    severity: D3D12_MESSAGE_SEVERITY,
    id: D3D12_MESSAGE_ID,
    description: PCSTR,
    _context: *mut c_void,
) {
    let level = match severity {
        D3D12_MESSAGE_SEVERITY_CORRUPTION | D3D12_MESSAGE_SEVERITY_ERROR => log::Level::Error,
        D3D12_MESSAGE_SEVERITY_WARNING => log::Level::Warn,
        D3D12_MESSAGE_SEVERITY_INFO => log::Level::Info,
        _ => log::Level::Debug,
    };

    log::log!(target: "gpu::d3d12", level, "{:?} {}", id, unsafe { description.display() });
}

struct DeviceShared {
    device: ID3D12Device,
}

// SAFETY: ID3D12Device is free-threaded.
unsafe impl Send for DeviceShared {}
unsafe impl Sync for DeviceShared {}

#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    /// Creates a device on the high-performance adapter, falling back to
    /// WARP. If [`Config::debug_enabled`], the debug layer is enabled and its
    /// messages are logged under the `gpu::d3d12` target.
    pub fn new(config: &Config) -> Result<Self> {
        let debug = config.debug_enabled();
        let factory: IDXGIFactory6 = {
            let flags = if debug { DXGI_CREATE_FACTORY_DEBUG } else { 0 };
            check("CreateDXGIFactory2", unsafe { CreateDXGIFactory2(flags) })?
        };

        let adapter: IDXGIAdapter = check(
            "EnumAdapterByGpuPreference",
            unsafe { factory.EnumAdapterByGpuPreference(0, DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE) }
                .or_else(|_| unsafe { factory.EnumWarpAdapter() }),
        )?;

        if debug {
            let mut dx_debug: Option<ID3D12Debug> = None;
            check("D3D12GetDebugInterface", unsafe {
                D3D12GetDebugInterface(&mut dx_debug)
            })?;
            if let Some(dx_debug) = dx_debug {
                unsafe { dx_debug.EnableDebugLayer() };
            }
        }

        let mut device: Option<ID3D12Device> = None;
        check("D3D12CreateDevice", unsafe {
            D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device)
        })?;
        let device = device.ok_or_else(|| Error::device("D3D12CreateDevice", "no device returned"))?;

        if debug {
            match device.cast::<ID3D12InfoQueue1>() {
                Ok(queue) => {
                    let mut cookie = 0;
                    check("RegisterMessageCallback", unsafe {
                        queue.RegisterMessageCallback(
                            Some(debug_callback),
                            D3D12_MESSAGE_CALLBACK_IGNORE_FILTERS,
                            std::ptr::null(),
                            &mut cookie,
                        )
                    })?;
                }
                Err(_) => log::warn!(
                    target: "gpu::d3d12",
                    "ID3D12InfoQueue1 is unavailable, debug layer messages will not be logged"
                ),
            }
        }

        Ok(Self::from_raw(device))
    }

    #[must_use]
    pub fn from_raw(device: ID3D12Device) -> Self {
        Self {
            shared: Arc::new(DeviceShared { device }),
        }
    }

    #[must_use]
    pub fn raw(&self) -> &ID3D12Device {
        &self.shared.device
    }
}

impl super::Device<Dx12> for Device {
    fn create_queue(&self, kind: QueueKind) -> Result<Queue> {
        let queue = check("CreateCommandQueue", unsafe {
            self.raw().CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: list_type(kind),
                ..Default::default()
            })
        })?;
        Ok(Queue { queue, kind })
    }

    fn create_fence(&self, initial_value: u64) -> Result<Fence> {
        let fence = check("CreateFence", unsafe {
            self.raw().CreateFence(initial_value, D3D12_FENCE_FLAG_NONE)
        })?;
        let event = check("CreateEventW", unsafe { CreateEventW(None, false, false, None) })?;
        Ok(Fence {
            fence,
            event: Mutex::new(event),
        })
    }

    fn create_command_allocator(&self, kind: QueueKind) -> Result<CommandAllocator> {
        let allocator = check("CreateCommandAllocator", unsafe {
            self.raw().CreateCommandAllocator(list_type(kind))
        })?;
        Ok(CommandAllocator { allocator })
    }

    fn create_command_list(
        &self,
        kind: QueueKind,
        allocator: &CommandAllocator,
    ) -> Result<CommandList> {
        let list = check("CreateCommandList", unsafe {
            self.raw()
                .CreateCommandList(0, list_type(kind), &allocator.allocator, None)
        })?;
        Ok(CommandList { list, kind })
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<DescriptorHeap> {
        let heap: ID3D12DescriptorHeap = check("CreateDescriptorHeap", unsafe {
            self.raw().CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: heap_type(kind),
                NumDescriptors: capacity,
                Flags: D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
                NodeMask: 0,
            })
        })?;

        let start = unsafe { heap.GetCPUDescriptorHandleForHeapStart() };
        let increment_size = unsafe { self.raw().GetDescriptorHandleIncrementSize(heap_type(kind)) };

        Ok(DescriptorHeap {
            heap,
            kind,
            capacity,
            start: CpuDescriptorHandle(start.ptr),
            increment_size,
        })
    }

    fn create_upload_buffer(&self, size: u64) -> Result<UploadBuffer> {
        let mut resource: Option<ID3D12Resource> = None;
        check("CreateCommittedResource", unsafe {
            self.raw().CreateCommittedResource(
                &D3D12_HEAP_PROPERTIES {
                    Type: D3D12_HEAP_TYPE_UPLOAD,
                    CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
                    MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
                    CreationNodeMask: 0,
                    VisibleNodeMask: 0,
                },
                D3D12_HEAP_FLAG_NONE,
                &D3D12_RESOURCE_DESC {
                    Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                    Alignment: 0,
                    Width: size,
                    Height: 1,
                    DepthOrArraySize: 1,
                    MipLevels: 1,
                    Format: DXGI_FORMAT_UNKNOWN,
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                    Flags: D3D12_RESOURCE_FLAG_NONE,
                },
                D3D12_RESOURCE_STATE_GENERIC_READ,
                None,
                &mut resource,
            )
        })?;
        let resource =
            resource.ok_or_else(|| Error::device("CreateCommittedResource", "no resource returned"))?;

        let mut ptr = std::ptr::null_mut();
        check("Map", unsafe { resource.Map(0, None, Some(&mut ptr)) })?;
        let ptr = NonNull::new(ptr.cast()).ok_or_else(|| Error::device("Map", "null mapping"))?;

        Ok(UploadBuffer {
            gpu_address: unsafe { resource.GetGPUVirtualAddress() },
            resource,
            ptr,
            size,
        })
    }
}

pub struct Queue {
    queue: ID3D12CommandQueue,
    kind: QueueKind,
}

// SAFETY: command queues are free-threaded.
unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

impl Queue {
    #[must_use]
    pub fn raw(&self) -> &ID3D12CommandQueue {
        &self.queue
    }
}

impl super::Queue<Dx12> for Queue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn execute_command_lists(&self, lists: &[&CommandList]) -> Result<()> {
        let mut native: SmallVec<[Option<ID3D12CommandList>; 16]> = SmallVec::new();
        for list in lists {
            debug_assert_eq!(list.kind, self.kind);
            native.push(Some(check("cast", list.list.cast())?));
        }
        unsafe { self.queue.ExecuteCommandLists(&native) };
        Ok(())
    }

    fn signal(&self, fence: &Fence, value: u64) -> Result<()> {
        check("Signal", unsafe { self.queue.Signal(&fence.fence, value) })
    }

    fn wait(&self, fence: &Fence, value: u64) -> Result<()> {
        check("Wait", unsafe { self.queue.Wait(&fence.fence, value) })
    }
}

pub struct Fence {
    fence: ID3D12Fence,
    /// One event per fence; waits are serialized on it.
    event: Mutex<HANDLE>,
}

// SAFETY: fences are free-threaded and the event is only used under the lock.
unsafe impl Send for Fence {}
unsafe impl Sync for Fence {}

impl super::Fence for Fence {
    fn completed_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    fn wait_for_value(&self, value: u64) -> Result<()> {
        if self.completed_value() >= value {
            return Ok(());
        }

        let event = self.event.lock();
        check("SetEventOnCompletion", unsafe {
            self.fence.SetEventOnCompletion(value, *event)
        })?;

        if unsafe { WaitForSingleObject(*event, u32::MAX) } != WAIT_OBJECT_0 {
            return Err(Error::device(
                "WaitForSingleObject",
                windows::core::Error::from_win32(),
            ));
        }
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { CloseHandle(*self.event.get_mut()) };
    }
}

pub struct CommandAllocator {
    allocator: ID3D12CommandAllocator,
}

// SAFETY: only used from one thread at a time.
unsafe impl Send for CommandAllocator {}

impl super::CommandAllocator for CommandAllocator {
    fn reset(&self) -> Result<()> {
        check("ID3D12CommandAllocator::Reset", unsafe {
            self.allocator.Reset()
        })
    }
}

pub struct CommandList {
    list: ID3D12GraphicsCommandList,
    kind: QueueKind,
}

// SAFETY: only used from one thread at a time.
unsafe impl Send for CommandList {}

impl CommandList {
    /// The native list, for recording everything that is not a barrier or a
    /// staging copy.
    #[must_use]
    pub fn raw(&self) -> &ID3D12GraphicsCommandList {
        &self.list
    }
}

impl super::CommandList<Dx12> for CommandList {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn reset(&mut self, allocator: &CommandAllocator) -> Result<()> {
        check("ID3D12GraphicsCommandList::Reset", unsafe {
            self.list.Reset(&allocator.allocator, None)
        })
    }

    fn close(&mut self) -> Result<()> {
        check("Close", unsafe { self.list.Close() })
    }

    fn resource_barrier(&mut self, barriers: &[Barrier]) {
        let native: SmallVec<[D3D12_RESOURCE_BARRIER; 16]> =
            barriers.iter().map(native_barrier).collect();
        unsafe { self.list.ResourceBarrier(&native) };
    }

    fn copy_buffer_region(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        src: &UploadBuffer,
        src_offset: u64,
        size: u64,
    ) {
        let dst = unsafe { borrow_resource(dst) };
        unsafe {
            self.list
                .CopyBufferRegion(&*dst, dst_offset, &src.resource, src_offset, size)
        };
    }

    fn copy_texture_region(
        &mut self,
        dst: ResourceId,
        subresource: u32,
        src: &UploadBuffer,
        footprint: &PlacedFootprint,
    ) {
        let dst_location = D3D12_TEXTURE_COPY_LOCATION {
            pResource: unsafe { resource_field(dst) },
            Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                SubresourceIndex: subresource,
            },
        };

        let src_location = D3D12_TEXTURE_COPY_LOCATION {
            pResource: unsafe { resource_field(resource_id(&src.resource)) },
            Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
            Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                    Offset: footprint.offset,
                    Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                        Format: DXGI_FORMAT(footprint.format),
                        Width: footprint.width,
                        Height: footprint.height,
                        Depth: footprint.depth,
                        RowPitch: footprint.row_pitch,
                    },
                },
            },
        };

        unsafe {
            self.list
                .CopyTextureRegion(&dst_location, 0, 0, 0, &src_location, None)
        };
    }
}

pub struct DescriptorHeap {
    heap: ID3D12DescriptorHeap,
    kind: DescriptorHeapKind,
    capacity: u32,
    start: CpuDescriptorHandle,
    increment_size: u32,
}

// SAFETY: descriptor heaps are free-threaded; writes to distinct descriptors
// do not race.
unsafe impl Send for DescriptorHeap {}
unsafe impl Sync for DescriptorHeap {}

impl DescriptorHeap {
    #[must_use]
    pub fn raw(&self) -> &ID3D12DescriptorHeap {
        &self.heap
    }
}

impl super::DescriptorHeap for DescriptorHeap {
    fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn cpu_start(&self) -> CpuDescriptorHandle {
        self.start
    }

    fn increment_size(&self) -> u32 {
        self.increment_size
    }
}

pub struct UploadBuffer {
    resource: ID3D12Resource,
    ptr: NonNull<u8>,
    size: u64,
    gpu_address: u64,
}

// SAFETY: the mapping is plain memory; writers coordinate through the
// allocators that hand out disjoint ranges of it.
unsafe impl Send for UploadBuffer {}
unsafe impl Sync for UploadBuffer {}

impl super::UploadBuffer for UploadBuffer {
    fn resource(&self) -> ResourceId {
        resource_id(&self.resource)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mapped_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn gpu_address(&self) -> u64 {
        self.gpu_address
    }
}

impl Drop for UploadBuffer {
    fn drop(&mut self) {
        unsafe { self.resource.Unmap(0, None) };
    }
}
