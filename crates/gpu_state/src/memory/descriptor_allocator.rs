use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use parking_lot::RwLock;

use crate::{
    backend::{Backend, DescriptorHeapKind},
    error::{Error, Result},
};

use super::descriptor::{DescriptorHandle, DescriptorPage, PageId};

/// Hands out descriptor ranges from a growing set of pages per heap kind.
///
/// Pages are never destroyed. Ranges come back through
/// [`DescriptorHandle`] drops and become reusable at the next
/// [`Self::release_stale_descriptors`].
pub struct DescriptorAllocator<B: Backend> {
    device: B::Device,
    page_sizes: [u32; DescriptorHeapKind::COUNT],
    pages: [RwLock<Vec<Arc<DescriptorPage<B>>>>; DescriptorHeapKind::COUNT],
    next_page_id: AtomicU32,
}

impl<B: Backend> DescriptorAllocator<B> {
    /// `page_sizes` is indexed by [`DescriptorHeapKind::index`]. No page is
    /// created before the first allocation of its kind.
    pub fn new(device: &B::Device, page_sizes: [u32; DescriptorHeapKind::COUNT]) -> Result<Self> {
        if page_sizes.contains(&0) {
            return Err(Error::InvalidConfig("descriptor page sizes must be non-zero"));
        }

        Ok(Self {
            device: device.clone(),
            page_sizes,
            pages: Default::default(),
            next_page_id: AtomicU32::new(0),
        })
    }

    /// Allocates `count` contiguous descriptors of `kind`, adding a page if
    /// no existing page has a large enough free run.
    pub fn allocate(&self, kind: DescriptorHeapKind, count: u32) -> Result<DescriptorHandle<B>> {
        if count == 0 {
            return Err(Error::OutOfDescriptors {
                kind,
                requested: count,
            });
        }

        let pages = &self.pages[kind.index()];

        if let Some(handle) = Self::allocate_from(&pages.read(), count) {
            return Ok(handle);
        }

        let mut pages = pages.write();
        // another thread may have grown the list in the meantime
        if let Some(handle) = Self::allocate_from(&pages, count) {
            return Ok(handle);
        }

        let capacity = self.page_sizes[kind.index()].max(count);
        let id = PageId(self.next_page_id.fetch_add(1, Ordering::Relaxed));
        log::debug!(
            target: "gpu_state::memory",
            "adding {kind:?} descriptor page {} with {capacity} descriptors",
            id.0
        );

        let page = Arc::new(DescriptorPage::new(&self.device, id, kind, capacity)?);
        let range = page
            .alloc(count)
            .ok_or(Error::OutOfDescriptors {
                kind,
                requested: count,
            })?;
        pages.push(page.clone());

        Ok(DescriptorHandle::new(page, range))
    }

    fn allocate_from(pages: &[Arc<DescriptorPage<B>>], count: u32) -> Option<DescriptorHandle<B>> {
        pages.iter().find_map(|page| {
            page.alloc(count)
                .map(|range| DescriptorHandle::new(page.clone(), range))
        })
    }

    pub fn alloc_cbv_srv_uav(&self, count: u32) -> Result<DescriptorHandle<B>> {
        self.allocate(DescriptorHeapKind::CbvSrvUav, count)
    }

    pub fn alloc_sampler(&self, count: u32) -> Result<DescriptorHandle<B>> {
        self.allocate(DescriptorHeapKind::Sampler, count)
    }

    pub fn alloc_rtv(&self, count: u32) -> Result<DescriptorHandle<B>> {
        self.allocate(DescriptorHeapKind::Rtv, count)
    }

    pub fn alloc_dsv(&self, count: u32) -> Result<DescriptorHandle<B>> {
        self.allocate(DescriptorHeapKind::Dsv, count)
    }

    /// Makes every range freed since the last call reusable. Call once per
    /// frame, after the fence of the frame that last used them.
    pub fn release_stale_descriptors(&self) {
        for pages in &self.pages {
            for page in pages.read().iter() {
                page.release_stale_descriptors();
            }
        }
    }

    #[must_use]
    pub fn page_count(&self, kind: DescriptorHeapKind) -> usize {
        self.pages[kind.index()].read().len()
    }

    /// Free descriptors of `kind` across all pages, not counting staged
    /// ranges.
    #[must_use]
    pub fn free_count(&self, kind: DescriptorHeapKind) -> u32 {
        self.pages[kind.index()]
            .read()
            .iter()
            .map(|page| page.free_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{self, Headless};

    fn allocator(page_size: u32) -> DescriptorAllocator<Headless> {
        DescriptorAllocator::new(&headless::Device::new(), [page_size; 4]).unwrap()
    }

    #[test]
    fn grows_a_page_when_full() {
        let allocator = allocator(8);

        let a = allocator.alloc_rtv(6).unwrap();
        let b = allocator.alloc_rtv(6).unwrap();
        assert_eq!(allocator.page_count(DescriptorHeapKind::Rtv), 2);
        assert_ne!(a.range().page(), b.range().page());

        // larger than a page: gets a page of its own size
        let big = allocator.alloc_rtv(20).unwrap();
        assert_eq!(big.count(), 20);
        assert_eq!(allocator.page_count(DescriptorHeapKind::Rtv), 3);

        // fits in the remainder of the first page
        let small = allocator.alloc_rtv(2).unwrap();
        assert_eq!(small.range().page(), a.range().page());

        assert_eq!(allocator.page_count(DescriptorHeapKind::Dsv), 0);
    }

    #[test]
    fn reuse_after_release() {
        let allocator = allocator(8);

        let handle = allocator.alloc_cbv_srv_uav(8).unwrap();
        let page = handle.range().page();
        drop(handle);

        // staged, not yet reusable
        let other = allocator.alloc_cbv_srv_uav(8).unwrap();
        assert_ne!(other.range().page(), page);

        allocator.release_stale_descriptors();
        let again = allocator.alloc_cbv_srv_uav(8).unwrap();
        assert_eq!(again.range().page(), page);
        assert_eq!(allocator.free_count(DescriptorHeapKind::CbvSrvUav), 0);
    }

    #[test]
    fn round_trip_restores_free_count() {
        let allocator = allocator(64);
        let sizes = [3, 7, 1, 16, 5, 9, 2];

        let first = allocator.alloc_sampler(1).unwrap();
        let before = allocator.free_count(DescriptorHeapKind::Sampler);

        let handles: Vec<_> = sizes
            .iter()
            .map(|&size| allocator.alloc_sampler(size).unwrap())
            .collect();
        drop(handles);
        allocator.release_stale_descriptors();

        assert_eq!(allocator.free_count(DescriptorHeapKind::Sampler), before);
        assert_eq!(allocator.page_count(DescriptorHeapKind::Sampler), 1);
        // fully coalesced: the whole tail is a single run again
        assert!(allocator.alloc_sampler(63).is_ok());
        drop(first);
    }

    #[test]
    fn zero_count_is_an_error() {
        let allocator = allocator(8);
        assert!(matches!(
            allocator.alloc_dsv(0),
            Err(Error::OutOfDescriptors { requested: 0, .. })
        ));
    }

    #[test]
    fn concurrent_allocation() {
        let allocator = allocator(32);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let handle = allocator.alloc_cbv_srv_uav(3).unwrap();
                        assert_eq!(handle.count(), 3);
                    }
                });
            }
        });

        allocator.release_stale_descriptors();
        let pages = allocator.page_count(DescriptorHeapKind::CbvSrvUav);
        assert_eq!(
            allocator.free_count(DescriptorHeapKind::CbvSrvUav),
            32 * pages as u32
        );
    }
}
