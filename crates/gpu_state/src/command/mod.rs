//! Command list recycling.
//!
//! Command lists and their allocators are paired one to one so that a list
//! can be recycled as soon as its own submission completes.

mod pool;
mod ring;

pub use pool::CommandListPool;
pub use ring::CommandListRing;

use crate::{
    backend::{Backend, CommandAllocator, CommandList, Device, QueueKind},
    error::Result,
};

/// A command list together with the allocator that backs it.
pub struct CommandBuffer<B: Backend> {
    kind: QueueKind,
    allocator: B::CommandAllocator,
    list: B::CommandList,
}

impl<B: Backend> CommandBuffer<B> {
    /// Creates a buffer whose list is open for recording.
    pub fn new(device: &B::Device, kind: QueueKind) -> Result<Self> {
        let allocator = device.create_command_allocator(kind)?;
        let list = device.create_command_list(kind, &allocator)?;
        Ok(Self {
            kind,
            allocator,
            list,
        })
    }

    #[must_use]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[must_use]
    pub fn list(&self) -> &B::CommandList {
        &self.list
    }

    pub fn list_mut(&mut self) -> &mut B::CommandList {
        &mut self.list
    }

    pub fn close(&mut self) -> Result<()> {
        self.list.close()
    }

    /// Reopens the list, keeping the allocator's memory.
    pub(crate) fn reopen(&mut self) -> Result<()> {
        self.list.reset(&self.allocator)
    }

    /// Reclaims the allocator's memory. The list must be closed and the GPU
    /// done with it.
    pub(crate) fn reset_allocator(&self) -> Result<()> {
        self.allocator.reset()
    }

    #[must_use]
    pub fn allocator(&self) -> &B::CommandAllocator {
        &self.allocator
    }

    pub(crate) fn from_parts(
        kind: QueueKind,
        allocator: B::CommandAllocator,
        list: B::CommandList,
    ) -> Self {
        Self {
            kind,
            allocator,
            list,
        }
    }

    pub(crate) fn into_parts(self) -> (B::CommandAllocator, B::CommandList) {
        (self.allocator, self.list)
    }
}
