//! Fixed-capacity descriptor pages with deferred reuse.
//!
//! A freed range is not reusable immediately: the GPU may still reference
//! descriptors copied out of it by in-flight work. It is staged on the page
//! and only returned to the free list by
//! [`DescriptorPage::release_stale_descriptors`], once per frame after the
//! frame fence.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use structures::{IndexPool, RangeFreeList};

use crate::{
    backend::{Backend, CpuDescriptorHandle, DescriptorHeap, DescriptorHeapKind, Device},
    error::Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageId(pub(crate) u32);

/// A contiguous run of descriptors within one page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorRange {
    page: PageId,
    offset: u32,
    count: u32,
    /// Index of the range's reference counter in the page.
    token: u32,
    cpu_start: CpuDescriptorHandle,
    increment_size: u32,
}

impl DescriptorRange {
    #[must_use]
    pub fn page(&self) -> PageId {
        self.page
    }

    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// CPU address of the `index`-th descriptor of the range.
    ///
    /// ## Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn cpu_handle(&self, index: u32) -> CpuDescriptorHandle {
        assert!(index < self.count, "descriptor {index} of {}", self.count);
        self.cpu_start.offset(index, self.increment_size)
    }
}

struct PageState {
    free: RangeFreeList,
    /// Freed `(offset, count)` ranges awaiting the next release.
    stale: Vec<(u32, u32)>,
    tokens: IndexPool,
}

pub struct DescriptorPage<B: Backend> {
    id: PageId,
    heap: B::DescriptorHeap,
    state: Mutex<PageState>,
    ref_counts: Box<[AtomicU32]>,
}

impl<B: Backend> DescriptorPage<B> {
    pub fn new(
        device: &B::Device,
        id: PageId,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<Self> {
        let heap = device.create_descriptor_heap(kind, capacity)?;
        Ok(Self {
            id,
            heap,
            state: Mutex::new(PageState {
                free: RangeFreeList::new(capacity),
                stale: Vec::new(),
                tokens: IndexPool::new(capacity),
            }),
            ref_counts: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
        })
    }

    #[must_use]
    pub fn id(&self) -> PageId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.heap.kind()
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.heap.capacity()
    }

    #[must_use]
    pub fn heap(&self) -> &B::DescriptorHeap {
        &self.heap
    }

    /// Descriptors available for allocation right now. Staged ranges do not
    /// count until they are released.
    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.state.lock().free.free_count()
    }

    #[must_use]
    pub fn stale_count(&self) -> u32 {
        self.state.lock().stale.iter().map(|(_, count)| count).sum()
    }

    /// Reserves `count` contiguous descriptors using the smallest free run
    /// that can hold them. The range starts with a reference count of 1.
    ///
    /// ## Returns
    ///
    /// `None` if no single free run is large enough.
    pub fn alloc(&self, count: u32) -> Option<DescriptorRange> {
        let mut state = self.state.lock();
        if count == 0 || count > state.free.free_count() {
            return None;
        }

        let offset = state.free.allocate(count)?;
        let Some(token) = state.tokens.acquire() else {
            state.free.free(offset, count);
            return None;
        };
        self.ref_counts[token as usize].store(1, Ordering::Release);

        Some(DescriptorRange {
            page: self.id,
            offset,
            count,
            token,
            cpu_start: self.heap.cpu_start().offset(offset, self.heap.increment_size()),
            increment_size: self.heap.increment_size(),
        })
    }

    /// Stages `range` for reuse after the next
    /// [`Self::release_stale_descriptors`].
    ///
    /// ## Panics
    ///
    /// Panics if the range belongs to another page or is still referenced.
    pub fn free(&self, range: DescriptorRange) {
        assert_eq!(range.page, self.id, "range freed on the wrong page");
        assert_eq!(
            self.ref_counts[range.token as usize].load(Ordering::Acquire),
            0,
            "descriptor range freed while still referenced"
        );

        let mut state = self.state.lock();
        state.stale.push((range.offset, range.count));
        state.tokens.release(range.token);
    }

    /// Returns every staged range to the free list, merging adjacent runs.
    pub fn release_stale_descriptors(&self) {
        let mut state = self.state.lock();
        let PageState { free, stale, .. } = &mut *state;
        for (offset, count) in stale.drain(..) {
            free.free(offset, count);
        }
    }

    /// ## Returns
    ///
    /// The new reference count.
    pub fn retain(&self, range: &DescriptorRange) -> u32 {
        self.ref_counts[range.token as usize].fetch_add(1, Ordering::Relaxed) + 1
    }

    /// ## Returns
    ///
    /// The new reference count.
    pub fn release(&self, range: &DescriptorRange) -> u32 {
        let previous = self.ref_counts[range.token as usize].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "descriptor range over-released");
        previous - 1
    }
}

/// A shared reference to a descriptor range. The range is freed back to its
/// page when the last handle is dropped.
pub struct DescriptorHandle<B: Backend> {
    page: Arc<DescriptorPage<B>>,
    range: Option<DescriptorRange>,
}

impl<B: Backend> DescriptorHandle<B> {
    pub(crate) fn new(page: Arc<DescriptorPage<B>>, range: DescriptorRange) -> Self {
        Self {
            page,
            range: Some(range),
        }
    }

    fn range_ref(&self) -> &DescriptorRange {
        self.range.as_ref().unwrap_or_else(|| unreachable!())
    }

    #[must_use]
    pub fn range(&self) -> &DescriptorRange {
        self.range_ref()
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.range_ref().count
    }

    #[must_use]
    pub fn kind(&self) -> DescriptorHeapKind {
        self.page.kind()
    }

    #[must_use]
    pub fn cpu_handle(&self, index: u32) -> CpuDescriptorHandle {
        self.range_ref().cpu_handle(index)
    }
}

impl<B: Backend> Clone for DescriptorHandle<B> {
    fn clone(&self) -> Self {
        let range = self.range_ref().clone();
        self.page.retain(&range);
        Self {
            page: self.page.clone(),
            range: Some(range),
        }
    }
}

impl<B: Backend> Drop for DescriptorHandle<B> {
    fn drop(&mut self) {
        if let Some(range) = self.range.take() {
            if self.page.release(&range) == 0 {
                self.page.free(range);
            }
        }
    }
}

impl<B: Backend> fmt::Debug for DescriptorHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorHandle")
            .field("range", &self.range)
            .finish()
    }
}
