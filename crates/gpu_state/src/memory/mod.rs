//! CPU-side bookkeeping for GPU memory: linear sub-allocation of upload
//! buffers and free-list management of descriptor heaps.

pub mod descriptor;
pub mod descriptor_allocator;
pub mod dynamic_buffer;
pub mod linear_allocator;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The heap does not have enough free memory left to satisfy the
    /// allocation request.
    #[error("{requested} bytes requested with {available} of {capacity} bytes available")]
    OutOfMemory {
        capacity: u64,
        available: u64,
        requested: u64,
    },
    /// The heap is not large enough to satisfy the allocation request even
    /// when empty.
    #[error("request exceeds the heap capacity")]
    InsufficientCapacity,
}

pub(crate) fn next_multiple_of(a: u64, b: u64) -> u64 {
    match a % b {
        0 => a,
        r => a + b - r,
    }
}
