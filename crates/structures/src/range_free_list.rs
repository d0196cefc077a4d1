use std::collections::{BTreeMap, BTreeSet};

/// A set of free, non-overlapping `[offset, offset + size)` ranges within a
/// fixed-size address space.
///
/// Ranges are indexed twice: by offset, so that a returned range can be merged
/// with its neighbours, and by `(size, offset)`, so that allocation can pick
/// the smallest range that satisfies a request. Both lookups are `O(log n)`.
///
/// The list does not remember which ranges were handed out. Inserting a range
/// that overlaps a free range is a bug in the calling code.
#[derive(Debug, Clone)]
pub struct RangeFreeList {
    by_offset: BTreeMap<u32, u32>,
    by_size: BTreeSet<(u32, u32)>,
    free_count: u32,
}

impl RangeFreeList {
    /// Creates a list with a single free range covering `[0, capacity)`.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        let mut list = Self::empty();
        if capacity > 0 {
            list.insert_range(0, capacity);
        }
        list
    }

    /// Creates a list with no free ranges.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            by_offset: BTreeMap::new(),
            by_size: BTreeSet::new(),
            free_count: 0,
        }
    }

    /// The sum of the sizes of all free ranges.
    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    /// The number of disjoint free ranges.
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.by_offset.len()
    }

    /// The size of the largest free range, or 0 if there is none.
    #[must_use]
    pub fn largest_range(&self) -> u32 {
        self.by_size.iter().next_back().map_or(0, |(size, _)| *size)
    }

    /// Iterates over the free ranges in offset order as `(offset, size)`.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.by_offset.iter().map(|(offset, size)| (*offset, *size))
    }

    /// Takes `size` units from the smallest free range that can hold them.
    ///
    /// The allocation is carved from the start of the chosen range and the
    /// remainder, if any, stays in the list.
    ///
    /// ## Returns
    ///
    /// The offset of the allocation, or `None` if no single range is large
    /// enough.
    pub fn allocate(&mut self, size: u32) -> Option<u32> {
        if size == 0 || size > self.free_count {
            return None;
        }

        let (range_size, offset) = *self.by_size.range((size, 0)..).next()?;
        self.remove_range(offset, range_size);

        if range_size > size {
            self.insert_range(offset + size, range_size - size);
        }

        Some(offset)
    }

    /// Returns `[offset, offset + size)` to the list, merging it with the free
    /// ranges directly before and after it.
    ///
    /// ## Panics
    ///
    /// Panics in debug builds if the range overlaps a range that is already
    /// free.
    pub fn free(&mut self, offset: u32, size: u32) {
        if size == 0 {
            return;
        }

        let mut start = offset;
        let mut end = offset + size;

        if let Some((&prev_offset, &prev_size)) = self.by_offset.range(..offset).next_back() {
            debug_assert!(
                prev_offset + prev_size <= offset,
                "freed range overlaps a free range"
            );
            if prev_offset + prev_size == offset {
                self.remove_range(prev_offset, prev_size);
                start = prev_offset;
            }
        }

        if let Some((&next_offset, &next_size)) = self.by_offset.range(offset..).next() {
            debug_assert!(next_offset >= end, "freed range overlaps a free range");
            if next_offset == end {
                self.remove_range(next_offset, next_size);
                end = next_offset + next_size;
            }
        }

        self.insert_range(start, end - start);
    }

    fn insert_range(&mut self, offset: u32, size: u32) {
        self.by_offset.insert(offset, size);
        self.by_size.insert((size, offset));
        self.free_count += size;
    }

    fn remove_range(&mut self, offset: u32, size: u32) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(size, offset));
        self.free_count -= size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_fit() {
        let mut list = RangeFreeList::empty();
        list.free(0, 10);
        list.free(20, 4);
        list.free(40, 6);

        // 5 fits in both the 10 and 6 ranges, 6 is the better fit
        assert_eq!(list.allocate(5), Some(40));
        assert_eq!(list.iter().collect::<Vec<_>>(), [(0, 10), (20, 4), (45, 1)]);

        assert_eq!(list.allocate(4), Some(20));
        assert_eq!(list.allocate(11), None);
        assert_eq!(list.free_count(), 11);
    }

    #[test]
    fn coalesce_both_sides() {
        let mut list = RangeFreeList::new(30);
        let a = list.allocate(10).unwrap();
        let b = list.allocate(10).unwrap();
        let c = list.allocate(10).unwrap();
        assert_eq!((a, b, c), (0, 10, 20));
        assert_eq!(list.free_count(), 0);
        assert_eq!(list.allocate(1), None);

        list.free(a, 10);
        list.free(c, 10);
        assert_eq!(list.range_count(), 2);

        list.free(b, 10);
        assert_eq!(list.range_count(), 1);
        assert_eq!(list.largest_range(), 30);
        assert_eq!(list.allocate(30), Some(0));
    }

    #[test]
    fn zero_sized() {
        let mut list = RangeFreeList::new(0);
        assert_eq!(list.allocate(0), None);
        list.free(0, 0);
        assert_eq!(list.range_count(), 0);
    }
}
