use std::collections::VecDeque;

use crate::{
    backend::{Backend, CommandAllocator, CommandList, Device, Queue, QueueKind},
    error::Result,
    fence::FenceSync,
};

use super::CommandBuffer;

/// Command buffers for a single queue, recycled as soon as the fence says
/// the GPU is done with them.
///
/// Lists are reusable right after submission; allocators only once the
/// submission that used them has completed. Allocators are handed out
/// oldest first.
pub struct CommandListPool<B: Backend> {
    device: B::Device,
    kind: QueueKind,
    lists: Vec<B::CommandList>,
    submissions: VecDeque<(B::CommandAllocator, u64)>,
}

impl<B: Backend> CommandListPool<B> {
    pub fn new(device: &B::Device, kind: QueueKind) -> Self {
        Self {
            device: device.clone(),
            kind,
            lists: Vec::new(),
            submissions: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// The number of allocators still waiting on the GPU or ready to reuse.
    #[must_use]
    pub fn allocator_count(&self) -> usize {
        self.submissions.len()
    }

    /// Takes a buffer open for recording.
    pub fn acquire(&mut self, fence: &FenceSync<B>) -> Result<CommandBuffer<B>> {
        let allocator = match self.submissions.pop_front() {
            Some((allocator, value)) if fence.is_complete(value) => {
                allocator.reset()?;
                allocator
            }
            in_flight => {
                if let Some(submission) = in_flight {
                    self.submissions.push_front(submission);
                }
                log::debug!(
                    target: "gpu_state::command",
                    "all {:?} command allocators in flight, allocating another",
                    self.kind
                );
                self.device.create_command_allocator(self.kind)?
            }
        };

        let list = if let Some(mut list) = self.lists.pop() {
            list.reset(&allocator)?;
            list
        } else {
            self.device.create_command_list(self.kind, &allocator)?
        };

        Ok(CommandBuffer::from_parts(self.kind, allocator, list))
    }

    /// Closes `buffer`, executes it on `queue` and signals `fence`.
    ///
    /// ## Returns
    ///
    /// The fence value that marks the buffer's completion.
    pub fn submit(
        &mut self,
        queue: &B::Queue,
        fence: &mut FenceSync<B>,
        mut buffer: CommandBuffer<B>,
    ) -> Result<u64> {
        debug_assert_eq!(queue.kind(), self.kind);

        buffer.close()?;
        queue.execute_command_lists(&[buffer.list()])?;
        let value = fence.issue(queue)?;

        let (allocator, list) = buffer.into_parts();
        self.lists.push(list);
        self.submissions.push_back((allocator, value));
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{self, Headless};

    #[test]
    fn allocators_wait_for_the_fence() {
        let device = headless::Device::new();
        let queue = device.create_queue(QueueKind::Copy).unwrap();
        let mut fence = FenceSync::<Headless>::new(&device).unwrap();
        let mut pool = CommandListPool::<Headless>::new(&device, QueueKind::Copy);

        queue.hold();
        let buffer = pool.acquire(&fence).unwrap();
        let first = pool.submit(&queue, &mut fence, buffer).unwrap();

        // still in flight: a second allocator is created
        let buffer = pool.acquire(&fence).unwrap();
        assert_eq!(buffer.allocator().reset_count(), 0);
        pool.submit(&queue, &mut fence, buffer).unwrap();
        assert_eq!(pool.allocator_count(), 2);

        queue.release();
        fence.cpu_wait(first).unwrap();

        let buffer = pool.acquire(&fence).unwrap();
        assert_eq!(buffer.allocator().reset_count(), 1);
        assert!(!buffer.list().is_closed());
        assert_eq!(pool.allocator_count(), 1);
    }
}
