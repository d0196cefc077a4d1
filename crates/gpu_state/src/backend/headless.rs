//! An in-memory backend without a GPU.
//!
//! Queues complete work as soon as it is submitted and keep a log of every
//! command they executed so that the barrier stream can be inspected. A queue
//! can be put on hold to simulate a GPU that lags behind the CPU.

use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Condvar, Mutex};

use super::{
    Backend, CpuDescriptorHandle, DescriptorHeapKind, PlacedFootprint, QueueKind,
};
use crate::{
    error::{Error, Result},
    state::{Barrier, ResourceId},
};

/// Upload buffers and fake resources are placed at 64 KiB granularity, like
/// real placed resources.
const ADDRESS_GRANULARITY: usize = 64 * 1024;

const DESCRIPTOR_INCREMENT: u32 = 32;

pub enum Headless {}

impl Backend for Headless {
    type Device = Device;
    type Queue = Queue;
    type Fence = Fence;
    type CommandAllocator = CommandAllocator;
    type CommandList = CommandList;
    type DescriptorHeap = DescriptorHeap;
    type UploadBuffer = UploadBuffer;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Barriers(Vec<Barrier>),
    CopyBuffer {
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        /// The staged bytes, captured when the copy was recorded.
        data: Vec<u8>,
    },
    CopyTexture {
        dst: ResourceId,
        subresource: u32,
        src: ResourceId,
        footprint: PlacedFootprint,
    },
}

/// One `execute_command_lists` call as seen by a queue.
#[derive(Clone, Debug)]
pub struct Execution {
    pub queue: QueueKind,
    /// The commands of each submitted list, in submission order.
    pub lists: Vec<Vec<Command>>,
}

impl Execution {
    /// Every barrier of the execution in GPU order.
    pub fn barriers(&self) -> impl Iterator<Item = &Barrier> + '_ {
        self.lists.iter().flatten().flat_map(|command| match command {
            Command::Barriers(barriers) => barriers.as_slice(),
            _ => &[],
        })
    }
}

struct DeviceShared {
    next_address: AtomicUsize,
    executions: Mutex<Vec<Execution>>,
}

#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(DeviceShared {
                next_address: AtomicUsize::new(ADDRESS_GRANULARITY),
                executions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Mints a fresh resource identity. The resource has no backing memory.
    pub fn create_resource(&self) -> ResourceId {
        self.reserve_address(1)
    }

    /// Every `execute_command_lists` call made on this device's queues, in
    /// order.
    #[must_use]
    pub fn executions(&self) -> Vec<Execution> {
        self.shared.executions.lock().clone()
    }

    /// Like [`Self::executions`], clearing the log.
    pub fn take_executions(&self) -> Vec<Execution> {
        std::mem::take(&mut *self.shared.executions.lock())
    }

    /// Every barrier executed so far, in submission order.
    #[must_use]
    pub fn executed_barriers(&self) -> Vec<Barrier> {
        self.shared
            .executions
            .lock()
            .iter()
            .flat_map(|execution| execution.barriers().copied().collect::<Vec<_>>())
            .collect()
    }

    fn reserve_address(&self, size: usize) -> ResourceId {
        let size = size.max(1).next_multiple_of(ADDRESS_GRANULARITY);
        let address = self.shared.next_address.fetch_add(size, Ordering::Relaxed);
        ResourceId::new(address).unwrap_or_else(|| unreachable!("address space starts above zero"))
    }
}

impl super::Device<Headless> for Device {
    fn create_queue(&self, kind: QueueKind) -> Result<Queue> {
        Ok(Queue {
            kind,
            device: self.shared.clone(),
            held: Mutex::new(None),
            removed: AtomicBool::new(false),
        })
    }

    fn create_fence(&self, initial_value: u64) -> Result<Fence> {
        Ok(Fence {
            shared: Arc::new(FenceShared {
                value: Mutex::new(initial_value),
                signaled: Condvar::new(),
            }),
        })
    }

    fn create_command_allocator(&self, kind: QueueKind) -> Result<CommandAllocator> {
        Ok(CommandAllocator {
            kind,
            resets: AtomicU64::new(0),
        })
    }

    fn create_command_list(
        &self,
        kind: QueueKind,
        allocator: &CommandAllocator,
    ) -> Result<CommandList> {
        debug_assert_eq!(kind, allocator.kind);
        Ok(CommandList {
            kind,
            commands: Vec::new(),
            closed: false,
        })
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<DescriptorHeap> {
        let size = capacity as usize * DESCRIPTOR_INCREMENT as usize;
        Ok(DescriptorHeap {
            kind,
            capacity,
            start: CpuDescriptorHandle(self.reserve_address(size).raw()),
        })
    }

    fn create_upload_buffer(&self, size: u64) -> Result<UploadBuffer> {
        let len = usize::try_from(size)
            .map_err(|_| Error::device("create_upload_buffer", "size exceeds address space"))?;
        let memory: Box<[u8]> = vec![0; len].into_boxed_slice();
        let ptr = NonNull::new(Box::into_raw(memory).cast::<u8>())
            .ok_or_else(|| Error::device("create_upload_buffer", "null allocation"))?;

        Ok(UploadBuffer {
            resource: self.reserve_address(len),
            ptr,
            len,
        })
    }
}

pub struct Queue {
    kind: QueueKind,
    device: Arc<DeviceShared>,
    held: Mutex<Option<Vec<(Arc<FenceShared>, u64)>>>,
    removed: AtomicBool,
}

impl Queue {
    /// Stops completing work. Signals are queued until [`Self::release`].
    pub fn hold(&self) {
        let mut held = self.held.lock();
        if held.is_none() {
            *held = Some(Vec::new());
        }
    }

    /// Completes all work queued since [`Self::hold`] and resumes immediate
    /// completion.
    pub fn release(&self) {
        let pending = self.held.lock().take().unwrap_or_default();
        for (fence, value) in pending {
            fence.complete(value);
        }
    }

    /// Makes every later `execute_command_lists` fail, as after a device
    /// removal.
    pub fn remove_device(&self) {
        self.removed.store(true, Ordering::Relaxed);
    }
}

impl super::Queue<Headless> for Queue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn execute_command_lists(&self, lists: &[&CommandList]) -> Result<()> {
        if self.removed.load(Ordering::Relaxed) {
            return Err(Error::device("execute_command_lists", "device removed"));
        }

        for list in lists {
            if !list.closed {
                return Err(Error::device(
                    "execute_command_lists",
                    "command list is still open",
                ));
            }
            if list.kind != self.kind {
                return Err(Error::device(
                    "execute_command_lists",
                    format!("{:?} list submitted to {:?} queue", list.kind, self.kind),
                ));
            }
        }

        self.device.executions.lock().push(Execution {
            queue: self.kind,
            lists: lists.iter().map(|list| list.commands.clone()).collect(),
        });
        Ok(())
    }

    fn signal(&self, fence: &Fence, value: u64) -> Result<()> {
        match &mut *self.held.lock() {
            Some(pending) => pending.push((fence.shared.clone(), value)),
            None => fence.shared.complete(value),
        }
        Ok(())
    }

    fn wait(&self, _fence: &Fence, _value: u64) -> Result<()> {
        // Work completes in submission order anyway.
        Ok(())
    }
}

struct FenceShared {
    value: Mutex<u64>,
    signaled: Condvar,
}

impl FenceShared {
    fn complete(&self, value: u64) {
        let mut current = self.value.lock();
        *current = (*current).max(value);
        self.signaled.notify_all();
    }
}

pub struct Fence {
    shared: Arc<FenceShared>,
}

impl super::Fence for Fence {
    fn completed_value(&self) -> u64 {
        *self.shared.value.lock()
    }

    fn wait_for_value(&self, value: u64) -> Result<()> {
        let mut current = self.shared.value.lock();
        while *current < value {
            self.shared.signaled.wait(&mut current);
        }
        Ok(())
    }
}

pub struct CommandAllocator {
    kind: QueueKind,
    resets: AtomicU64,
}

impl CommandAllocator {
    #[must_use]
    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}

impl super::CommandAllocator for CommandAllocator {
    fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

pub struct CommandList {
    kind: QueueKind,
    commands: Vec<Command>,
    closed: bool,
}

impl CommandList {
    /// The commands recorded since the last reset.
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl super::CommandList<Headless> for CommandList {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn reset(&mut self, allocator: &CommandAllocator) -> Result<()> {
        if !self.closed {
            return Err(Error::device("reset", "command list is still open"));
        }
        debug_assert_eq!(self.kind, allocator.kind);
        self.commands.clear();
        self.closed = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::device("close", "command list is already closed"));
        }
        self.closed = true;
        Ok(())
    }

    fn resource_barrier(&mut self, barriers: &[Barrier]) {
        debug_assert!(!self.closed);
        if let Some(Command::Barriers(previous)) = self.commands.last_mut() {
            previous.extend_from_slice(barriers);
        } else {
            self.commands.push(Command::Barriers(barriers.to_vec()));
        }
    }

    fn copy_buffer_region(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        src: &UploadBuffer,
        src_offset: u64,
        size: u64,
    ) {
        debug_assert!(!self.closed);
        let start = src_offset as usize;
        let data = src.as_slice()[start..start + size as usize].to_vec();
        self.commands.push(Command::CopyBuffer {
            dst,
            dst_offset,
            src: src.resource,
            src_offset,
            data,
        });
    }

    fn copy_texture_region(
        &mut self,
        dst: ResourceId,
        subresource: u32,
        src: &UploadBuffer,
        footprint: &PlacedFootprint,
    ) {
        debug_assert!(!self.closed);
        self.commands.push(Command::CopyTexture {
            dst,
            subresource,
            src: src.resource,
            footprint: *footprint,
        });
    }
}

pub struct DescriptorHeap {
    kind: DescriptorHeapKind,
    capacity: u32,
    start: CpuDescriptorHandle,
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
        DESCRIPTOR_INCREMENT
    }
}

pub struct UploadBuffer {
    resource: ResourceId,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the buffer exclusively owns its allocation. Concurrent writes
// through `mapped_ptr` are the caller's responsibility, as with a real
// mapped buffer.
unsafe impl Send for UploadBuffer {}
unsafe impl Sync for UploadBuffer {}

impl UploadBuffer {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl super::UploadBuffer for UploadBuffer {
    fn resource(&self) -> ResourceId {
        self.resource
    }

    fn size(&self) -> u64 {
        self.len as u64
    }

    fn mapped_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn gpu_address(&self) -> u64 {
        self.resource.raw() as u64
    }
}

impl Drop for UploadBuffer {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        drop(unsafe { Box::from_raw(slice) });
    }
}
