//! The per-page metadata table.
//!
//! Every managed page has two entries, indexed by page number: the rank of
//! the block it currently belongs to, and whether that block is allocated.
//! Both tables are carved out of a single caller-provided metadata region so
//! the allocator performs no allocations of its own.

use core::{alloc::Layout, ptr::NonNull};

use crate::{bitmap::Bitmap, pages_for_rank};

pub struct PageTable {
    page_count: usize,
    ranks: *mut u8,
    allocated: Bitmap,
}

impl PageTable {
    /// Returns the layout of a metadata region suitable for `page_count`
    /// pages.
    pub fn metadata_layout(page_count: usize) -> Layout {
        Self::layout_parts(page_count).0
    }

    /// Returns the metadata layout together with the offset of the allocated
    /// bitmap within it.
    fn layout_parts(page_count: usize) -> (Layout, usize) {
        let ranks = Layout::array::<u8>(page_count).expect("rank map layout error");

        let (layout, bitmap_offset) = ranks
            .extend(Bitmap::map_layout(page_count))
            .expect("page table layout error");

        (layout, bitmap_offset)
    }

    /// Constructs a page table for `page_count` pages over `metadata`, with
    /// every rank entry zeroed and every allocated bit cleared.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `metadata` must satisfy the `Layout` returned by
    ///   [`Self::metadata_layout(page_count)`](Self::metadata_layout), and it
    ///   must be valid for reads and writes for the entire size indicated by
    ///   that `Layout`.
    /// - The memory at `metadata` must not be accessed through any other
    ///   pointer while the table exists.
    pub unsafe fn new(page_count: usize, metadata: NonNull<u8>) -> PageTable {
        assert!(page_count > 0);

        let (_, bitmap_offset) = Self::layout_parts(page_count);

        let ranks = metadata.as_ptr();

        for i in 0..(page_count as isize) {
            unsafe { ranks.offset(i).write(0) };
        }

        // The bitmap offset produced by `Layout::extend` is aligned for u64.
        let words = unsafe { metadata.as_ptr().add(bitmap_offset) }.cast::<u64>();
        let allocated = unsafe { Bitmap::new(page_count, words) };

        PageTable {
            page_count,
            ranks,
            allocated,
        }
    }

    /// Returns the rank of the block owning the page at `index`.
    #[inline]
    pub fn rank(&self, index: usize) -> usize {
        assert!(index < self.page_count);

        unsafe { usize::from(self.ranks.add(index).read()) }
    }

    /// Returns `true` if the page at `index` belongs to an allocated block.
    #[inline]
    pub fn is_allocated(&self, index: usize) -> bool {
        self.allocated.get(index)
    }

    /// Stamps the rank and allocated state across every page of the block of
    /// `rank` starting at `index`.
    pub fn set_block(&mut self, index: usize, rank: usize, allocated: bool) {
        let pages = pages_for_rank(rank);

        debug_assert_eq!(index % pages, 0, "block start unaligned for its rank");
        assert!(index + pages <= self.page_count);
        debug_assert!(rank <= usize::from(u8::MAX));

        for i in index..index + pages {
            unsafe { self.ranks.add(i).write(rank as u8) };
            self.allocated.set(i, allocated);
        }
    }
}
