use crate::{
    backend::{Backend, QueueKind},
    error::Result,
    fence::{QueueFences, SubmissionId},
};

use super::CommandBuffer;

struct FrameSlot<B: Backend> {
    free: [Vec<CommandBuffer<B>>; QueueKind::COUNT],
    in_flight: Vec<CommandBuffer<B>>,
    /// Everything submitted while the slot was current.
    submission: SubmissionId,
}

/// Command buffers for a fixed number of frames in flight.
///
/// Buffers acquired during a frame are retired into that frame's slot after
/// submission and only become available again when the ring comes back
/// around to the slot and the slot's submissions have completed.
pub struct CommandListRing<B: Backend> {
    device: B::Device,
    slots: Box<[FrameSlot<B>]>,
    current: usize,
}

impl<B: Backend> CommandListRing<B> {
    /// Creates the ring with `lists_per_frame` graphics command buffers
    /// pre-allocated in each slot. Other kinds are created on demand.
    pub fn new(device: &B::Device, frames_in_flight: usize, lists_per_frame: usize) -> Result<Self> {
        assert!(frames_in_flight > 0);

        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            let mut graphics = Vec::with_capacity(lists_per_frame);
            for _ in 0..lists_per_frame {
                let mut buffer = CommandBuffer::<B>::new(device, QueueKind::Graphics)?;
                buffer.close()?;
                graphics.push(buffer);
            }

            slots.push(FrameSlot {
                free: [graphics, Vec::new(), Vec::new()],
                in_flight: Vec::new(),
                submission: SubmissionId::default(),
            });
        }

        Ok(Self {
            device: device.clone(),
            slots: slots.into_boxed_slice(),
            current: 0,
        })
    }

    #[must_use]
    pub fn frame_index(&self) -> usize {
        self.current
    }

    #[must_use]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// The number of closed, reusable buffers of `kind` in the current slot.
    #[must_use]
    pub fn free_count(&self, kind: QueueKind) -> usize {
        self.slots[self.current].free[kind.index()].len()
    }

    /// Takes a buffer open for recording from the current slot, creating one
    /// if the slot has run out.
    pub fn acquire(&mut self, kind: QueueKind) -> Result<CommandBuffer<B>> {
        if let Some(mut buffer) = self.slots[self.current].free[kind.index()].pop() {
            buffer.reopen()?;
            Ok(buffer)
        } else {
            log::debug!(
                target: "gpu_state::command",
                "frame slot {} out of {kind:?} command lists, allocating another",
                self.current
            );
            CommandBuffer::<B>::new(&self.device, kind)
        }
    }

    /// Hands a submitted (closed) buffer back to the current slot.
    pub fn retire(&mut self, buffer: CommandBuffer<B>) {
        self.slots[self.current].in_flight.push(buffer);
    }

    /// Waits for the GPU to finish the work last submitted from the current
    /// slot and recycles the slot's buffers.
    pub fn begin_frame(&mut self, fences: &QueueFences<B>) -> Result<()> {
        let slot = &mut self.slots[self.current];
        fences.cpu_wait(slot.submission)?;
        slot.submission = SubmissionId::default();

        for buffer in slot.in_flight.drain(..) {
            buffer.reset_allocator()?;
            slot.free[buffer.kind().index()].push(buffer);
        }
        Ok(())
    }

    /// Records what the current slot submitted and moves on to the next one.
    pub fn end_frame(&mut self, submission: SubmissionId) {
        let slot = &mut self.slots[self.current];
        slot.submission = slot.submission.merge(submission);
        self.current = (self.current + 1) % self.slots.len();
    }
}
