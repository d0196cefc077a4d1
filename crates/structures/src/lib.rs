//! Small allocation-bookkeeping containers shared by the GPU crates.
//!
//! None of these touch GPU memory themselves; they hand out offsets and
//! indices that the caller maps onto heaps and arenas it owns.

pub mod index_pool;
pub mod range_free_list;

pub use index_pool::IndexPool;
pub use range_free_list::RangeFreeList;
