use std::cell::Cell;

use crate::{
    backend::{Backend, Device, Fence, Queue, QueueKind},
    error::Result,
};

/// Identifies the GPU work of one submission: the fence value signaled on
/// each queue it touched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmissionId([u64; QueueKind::COUNT]);

impl SubmissionId {
    #[must_use]
    pub fn new(queue: QueueKind, value: u64) -> Self {
        let mut values = [0; QueueKind::COUNT];
        values[queue.index()] = value;
        Self(values)
    }

    /// The fence value signaled on `queue`, if the submission used it.
    #[must_use]
    pub fn value(&self, queue: QueueKind) -> Option<u64> {
        match self.0[queue.index()] {
            0 => None,
            value => Some(value),
        }
    }

    /// A submission that completes when both `self` and `other` have.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let mut values = self.0;
        for (value, other) in values.iter_mut().zip(other.0) {
            *value = (*value).max(other);
        }
        Self(values)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|value| *value == 0)
    }
}

/// A fence plus the next value to signal on it.
///
/// Values are issued in strictly increasing order starting at 1, so a fence
/// value of `v` completing implies every value below `v` has as well.
pub struct FenceSync<B: Backend> {
    fence: B::Fence,
    last_completed: Cell<u64>,
    next_value: u64,
}

impl<B: Backend> FenceSync<B> {
    pub fn new(device: &B::Device) -> Result<Self> {
        Ok(Self {
            fence: device.create_fence(0)?,
            last_completed: Cell::new(0),
            next_value: 1,
        })
    }

    #[must_use]
    pub fn fence(&self) -> &B::Fence {
        &self.fence
    }

    /// Has `queue` signal the next fence value once the work submitted so far
    /// completes.
    pub fn issue(&mut self, queue: &B::Queue) -> Result<u64> {
        let value = self.next_value;
        queue.signal(&self.fence, value)?;
        self.next_value += 1;
        Ok(value)
    }

    /// The most recently issued value, 0 if none was.
    #[must_use]
    pub fn last_issued(&self) -> u64 {
        self.next_value - 1
    }

    pub fn poll(&self) -> u64 {
        let completed = self.last_completed.get().max(self.fence.completed_value());
        self.last_completed.set(completed);
        completed
    }

    #[must_use]
    pub fn is_complete(&self, value: u64) -> bool {
        if value > self.last_completed.get() {
            self.poll();
        }
        value <= self.last_completed.get()
    }

    /// Blocks until the fence reaches `value`.
    pub fn cpu_wait(&self, value: u64) -> Result<()> {
        debug_assert!(value <= self.last_issued(), "waiting on a value never issued");
        if !self.is_complete(value) {
            self.fence.wait_for_value(value)?;
            self.last_completed.set(value);
        }
        Ok(())
    }

    /// Makes `queue` wait on the GPU for the fence to reach `value`.
    pub fn gpu_wait(&self, queue: &B::Queue, value: u64) -> Result<()> {
        queue.wait(&self.fence, value)
    }

    /// Issues a new value on `queue` and blocks until the GPU reaches it.
    pub fn flush(&mut self, queue: &B::Queue) -> Result<()> {
        let value = self.issue(queue)?;
        self.cpu_wait(value)
    }
}

/// One [`FenceSync`] per queue kind.
pub struct QueueFences<B: Backend> {
    fences: [FenceSync<B>; QueueKind::COUNT],
}

impl<B: Backend> QueueFences<B> {
    pub fn new(device: &B::Device) -> Result<Self> {
        Ok(Self {
            fences: [
                FenceSync::new(device)?,
                FenceSync::new(device)?,
                FenceSync::new(device)?,
            ],
        })
    }

    #[must_use]
    pub fn get(&self, queue: QueueKind) -> &FenceSync<B> {
        &self.fences[queue.index()]
    }

    pub fn issue(&mut self, queue: &B::Queue) -> Result<SubmissionId> {
        let kind = queue.kind();
        let value = self.fences[kind.index()].issue(queue)?;
        Ok(SubmissionId::new(kind, value))
    }

    #[must_use]
    pub fn is_complete(&self, submission: SubmissionId) -> bool {
        QueueKind::ALL.iter().all(|&kind| match submission.value(kind) {
            Some(value) => self.get(kind).is_complete(value),
            None => true,
        })
    }

    pub fn cpu_wait(&self, submission: SubmissionId) -> Result<()> {
        for kind in QueueKind::ALL {
            if let Some(value) = submission.value(kind) {
                self.get(kind).cpu_wait(value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{self, Headless};

    #[test]
    fn values_increase() {
        let device = headless::Device::new();
        let queue = device.create_queue(QueueKind::Graphics).unwrap();
        let mut sync = FenceSync::<Headless>::new(&device).unwrap();

        assert_eq!(sync.last_issued(), 0);
        assert_eq!(sync.issue(&queue).unwrap(), 1);
        assert_eq!(sync.issue(&queue).unwrap(), 2);
        assert!(sync.is_complete(2));
        sync.flush(&queue).unwrap();
        assert_eq!(sync.poll(), 3);
    }

    #[test]
    fn completion_follows_the_gpu() {
        let device = headless::Device::new();
        let queue = device.create_queue(QueueKind::Compute).unwrap();
        let mut sync = FenceSync::<Headless>::new(&device).unwrap();

        queue.hold();
        let value = sync.issue(&queue).unwrap();
        assert!(!sync.is_complete(value));

        queue.release();
        assert!(sync.is_complete(value));
        sync.cpu_wait(value).unwrap();
    }

    #[test]
    fn submissions_span_queues() {
        let device = headless::Device::new();
        let graphics = device.create_queue(QueueKind::Graphics).unwrap();
        let copy = device.create_queue(QueueKind::Copy).unwrap();
        let mut fences = QueueFences::<Headless>::new(&device).unwrap();

        copy.hold();
        let submission = fences
            .issue(&graphics)
            .unwrap()
            .merge(fences.issue(&copy).unwrap());

        assert_eq!(submission.value(QueueKind::Graphics), Some(1));
        assert_eq!(submission.value(QueueKind::Compute), None);
        assert_eq!(submission.value(QueueKind::Copy), Some(1));
        assert!(!fences.is_complete(submission));

        copy.release();
        assert!(fences.is_complete(submission));
        assert!(fences.is_complete(SubmissionId::default()));
    }
}
