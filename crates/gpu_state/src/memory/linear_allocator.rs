use std::ptr::NonNull;

use super::{next_multiple_of, Error};

/// A bump allocator over a mapped buffer.
///
/// Offsets are aligned relative to the start of the buffer, which is assumed
/// to be placed at least as strictly aligned as any request.
pub struct LinearAllocator {
    capacity: u64,
    heap_ptr: NonNull<u8>,
    bytes_allocated: u64,
}

// SAFETY: the allocator hands out disjoint slices of memory it was given
// exclusive access to.
unsafe impl Send for LinearAllocator {}

impl LinearAllocator {
    /// ## Safety
    ///
    /// `heap_ptr` must be valid for writes of `capacity` bytes for as long as
    /// the allocator is in use, and nothing else may access that memory
    /// through slices the allocator did not hand out.
    pub unsafe fn new(capacity: u64, heap_ptr: NonNull<u8>) -> Self {
        Self {
            capacity,
            heap_ptr,
            bytes_allocated: 0,
        }
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes_allocated == 0
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn can_fit(&self, size: u64, align: u64) -> bool {
        next_multiple_of(self.bytes_allocated, align) + size <= self.capacity
    }

    /// Reserves `size` bytes at the next offset aligned to `align`.
    ///
    /// ## Returns
    ///
    /// The offset of the allocation and its memory.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<(u64, &mut [u8]), Error> {
        if size > self.capacity {
            return Err(Error::InsufficientCapacity);
        }

        let offset = next_multiple_of(self.bytes_allocated, align);
        if offset + size > self.capacity {
            return Err(Error::OutOfMemory {
                capacity: self.capacity,
                available: self.capacity.saturating_sub(offset),
                requested: size,
            });
        }

        self.bytes_allocated = offset + size;

        let ptr = unsafe { self.heap_ptr.as_ptr().add(offset as usize) };
        Ok((offset, unsafe {
            std::slice::from_raw_parts_mut(ptr, size as usize)
        }))
    }

    pub fn clear(&mut self) {
        self.bytes_allocated = 0;
    }
}
