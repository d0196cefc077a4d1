/// A bounded pool of `u32` slot indices.
///
/// Indices are handed out in increasing order until the pool reaches its
/// capacity, after which only previously released indices are reused (most
/// recently released first). The pool only tracks which indices are in use;
/// the storage they refer to lives elsewhere.
#[derive(Debug, Clone)]
pub struct IndexPool {
    capacity: u32,
    next_unused: u32,
    free: Vec<u32>,
}

impl IndexPool {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            next_unused: 0,
            free: Vec::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The number of indices currently handed out.
    #[must_use]
    pub fn in_use(&self) -> u32 {
        self.next_unused - self.free.len() as u32
    }

    /// Takes an index from the pool.
    ///
    /// ## Returns
    ///
    /// `None` if every index below the capacity is in use.
    pub fn acquire(&mut self) -> Option<u32> {
        if let Some(index) = self.free.pop() {
            Some(index)
        } else if self.next_unused < self.capacity {
            let index = self.next_unused;
            self.next_unused += 1;
            Some(index)
        } else {
            None
        }
    }

    /// Returns an index to the pool.
    ///
    /// ## Panics
    ///
    /// Panics if the index was never handed out by this pool. Releasing the
    /// same index twice is only caught in debug builds.
    pub fn release(&mut self, index: u32) {
        assert!(index < self.next_unused, "index {index} was never acquired");
        debug_assert!(!self.free.contains(&index), "index {index} released twice");
        self.free.push(index);
    }
}
