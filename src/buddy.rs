//! A binary-buddy allocator over fixed-size page frames.
//!
//! [`PageBuddy`] manages a caller-supplied region of `page_count` pages. At
//! initialization the region is greedily decomposed, from the lowest address
//! upward, into the largest aligned power-of-two blocks that fit; this is the
//! same decomposition the binary representation of `page_count` produces,
//! with each block capped at rank [`MAX_RANK`]. Allocation pops the smallest
//! sufficient free block and splits it down to the requested rank;
//! deallocation re-merges blocks with their buddies as far as possible.
//!
//! Free blocks carry their own list node in their first page, so the only
//! memory the allocator needs besides the managed region is a flat metadata
//! table sized by [`PageBuddy::metadata_layout`].

use core::{alloc::Layout, fmt, mem, num::NonZeroUsize, ptr::NonNull};

use crate::{
    base::{BasePtr, BlockLink},
    pages_for_rank,
    polyfill::NonNullStrict,
    table::PageTable,
    AllocInitError, BackingAllocator, Error, Raw, MAX_RANK, PAGE_SIZE,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

// A free block must be able to hold its own list node.
const _: () = assert!(PAGE_SIZE >= mem::size_of::<BlockLink>());
const _: () = assert!(PAGE_SIZE % mem::align_of::<BlockLink>() == 0);

/// An intrusive singly-linked list of free blocks of one rank.
///
/// The node of each block lives in the block's first page; only the head
/// address is stored here. Insertion is at the head, so the list is
/// unordered.
struct FreeList {
    head: Option<NonZeroUsize>,
}

impl FreeList {
    const EMPTY: FreeList = FreeList { head: None };

    /// Pushes a block onto the head of the list.
    ///
    /// # Safety
    ///
    /// The memory at `block` must be within the provenance of `base`, valid
    /// for reads and writes for `size_of::<BlockLink>()` bytes, and
    /// unallocated by the associated allocator.
    unsafe fn push(&mut self, base: BasePtr, block: NonZeroUsize) {
        assert_eq!(block.get() & (mem::align_of::<BlockLink>() - 1), 0);

        unsafe { base.init_link_at(block, BlockLink { next: self.head }) };
        self.head = Some(block);
    }

    /// Removes and returns the block at the head of the list.
    ///
    /// # Safety
    ///
    /// Every block on the list must hold an initialized link within the
    /// provenance of `base`.
    unsafe fn pop(&mut self, base: BasePtr) -> Option<NonZeroUsize> {
        let head = self.head?;
        self.head = unsafe { base.link(head) }.next;

        Some(head)
    }

    /// Unlinks the specified block.
    ///
    /// # Safety
    ///
    /// `block` must be an element of this list.
    unsafe fn remove(&mut self, base: BasePtr, block: NonZeroUsize) {
        let mut prev: Option<NonZeroUsize> = None;
        let mut cur = self.head;

        while let Some(c) = cur {
            let next = unsafe { base.link(c) }.next;

            if c == block {
                match prev {
                    // Link the predecessor forward to the successor.
                    Some(p) => unsafe { base.link_mut(p) }.next = next,

                    // `block` is the head of the list.
                    None => self.head = next,
                }

                return;
            }

            prev = Some(c);
            cur = next;
        }

        unreachable!("block missing from its free list");
    }

    /// Returns the number of blocks on the list.
    fn len(&self, base: BasePtr) -> usize {
        let mut count = 0;
        let mut cur = self.head;

        while let Some(c) = cur {
            count += 1;

            // SAFETY: list membership implies the block is unallocated and
            // holds an initialized link.
            cur = unsafe { base.link(c) }.next;
        }

        count
    }
}

/// A buddy allocator over a contiguous region of pages.
///
/// Blocks are requested by rank: a rank-`r` block spans `2^(r - 1)` pages and
/// starts at an index that is a multiple of its size. See the [crate
/// docs](crate) for the algorithm.
///
/// The allocator is single-threaded; every operation takes `&self` or
/// `&mut self`, and a concurrent deployment must serialize all calls behind a
/// single mutual-exclusion region (the `global` module does exactly that).
pub struct PageBuddy<A: BackingAllocator> {
    /// Pointer to the region managed by this allocator.
    base: BasePtr,
    /// Pointer to the region that backs the page table.
    ///
    /// This must not be used while the allocator exists; it is stored solely
    /// so that it may be returned in `into_raw_parts()`.
    metadata: NonNull<u8>,
    /// The number of pages managed by this allocator.
    page_count: usize,
    table: PageTable,
    free_lists: [FreeList; MAX_RANK],
    backing_allocator: A,
}

impl PageBuddy<Raw> {
    /// Constructs a new `PageBuddy` from raw pointers.
    ///
    /// The entire region starts out free, decomposed into the largest
    /// aligned blocks that fit.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `page_count` is zero or
    /// the region size overflows a `usize`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be a pointer to a region that satisfies the [`Layout`]
    ///   returned by [`Self::region_layout(page_count)`], and it must be
    ///   valid for reads and writes for the entire size indicated by that
    ///   `Layout`.
    /// - `metadata` must be a pointer to a region that satisfies the
    ///   [`Layout`] returned by [`Self::metadata_layout(page_count)`], and it
    ///   must be valid for reads and writes for the entire size indicated by
    ///   that `Layout`.
    ///
    /// [`Self::region_layout(page_count)`]: Self::region_layout
    /// [`Self::metadata_layout(page_count)`]: Self::metadata_layout
    /// [`Layout`]: core::alloc::Layout
    pub unsafe fn new_raw(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
        page_count: usize,
    ) -> Result<PageBuddy<Raw>, AllocInitError> {
        unsafe {
            PageBuddyParts::new(metadata, region, page_count)
                .map(|parts| parts.with_backing_allocator(Raw))
        }
    }
}

#[cfg(any(feature = "alloc", test))]
impl PageBuddy<Global> {
    /// Constructs a new `PageBuddy` backed by the global allocator.
    ///
    /// Both the managed region and the metadata region are allocated from
    /// the global heap and returned to it when the allocator is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `page_count` is zero or
    /// the region size overflows a `usize`, and
    /// [`AllocInitError::AllocFailed`] if the underlying allocation fails.
    pub fn try_new(page_count: usize) -> Result<PageBuddy<Global>, AllocInitError> {
        if page_count == 0 || page_count.checked_mul(PAGE_SIZE).is_none() {
            return Err(AllocInitError::InvalidConfig);
        }

        let region_layout = Self::region_layout(page_count);
        let metadata_layout = Self::metadata_layout(page_count);

        unsafe {
            let region = NonNull::new(alloc::alloc::alloc(region_layout))
                .ok_or(AllocInitError::AllocFailed(region_layout))?;

            let metadata = match NonNull::new(alloc::alloc::alloc(metadata_layout)) {
                Some(m) => m,
                None => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    return Err(AllocInitError::AllocFailed(metadata_layout));
                }
            };

            match PageBuddyParts::new(metadata, region, page_count) {
                Ok(parts) => Ok(parts.with_backing_allocator(Global)),
                Err(err) => {
                    alloc::alloc::dealloc(metadata.as_ptr(), metadata_layout);
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    Err(err)
                }
            }
        }
    }
}

impl<A: BackingAllocator> PageBuddy<A> {
    /// Returns the layout requirements of the region managed by an allocator
    /// over `page_count` pages.
    ///
    /// # Panics
    ///
    /// Panics if the region size overflows a `usize`.
    pub fn region_layout(page_count: usize) -> Layout {
        let size = page_count
            .checked_mul(PAGE_SIZE)
            .expect("region size overflows usize");

        Layout::from_size_align(size, PAGE_SIZE).expect("region layout error")
    }

    /// Returns the layout requirements of the metadata region for an
    /// allocator over `page_count` pages.
    pub fn metadata_layout(page_count: usize) -> Layout {
        PageTable::metadata_layout(page_count)
    }

    /// Attempts to allocate a block of `rank`, spanning `2^(rank - 1)`
    /// pages.
    ///
    /// On success, the returned pointer addresses the first page of the
    /// block; its offset from the region base is a multiple of the block
    /// size. The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `rank` is outside
    /// `1..=MAX_RANK`, and [`Error::OutOfMemory`] if no free block of rank
    /// `rank` or greater exists. A rejected call does not modify the
    /// allocator.
    pub fn allocate(&mut self, rank: usize) -> Result<NonNull<u8>, Error> {
        if !(1..=MAX_RANK).contains(&rank) {
            return Err(Error::InvalidArgument);
        }

        // Scan upward for the first rank that has a free block.
        let (block, mut held_rank) = (rank..=MAX_RANK)
            .find_map(|r| {
                let block = unsafe { self.free_lists[r - 1].pop(self.base) }?;
                Some((block, r))
            })
            .ok_or(Error::OutOfMemory)?;

        let index = self.index_of(block);

        // Halve the held block until it matches the request. The retained
        // half keeps the low address; the high half becomes free at the next
        // rank down.
        while held_rank > rank {
            held_rank -= 1;

            let half_index = index + pages_for_rank(held_rank);
            let half = self.addr_of_index(half_index);

            unsafe { self.free_lists[held_rank - 1].push(self.base, half) };
            self.table.set_block(half_index, held_rank, false);
        }

        self.table.set_block(index, rank, true);

        Ok(self.base.with_addr(block))
    }

    /// Returns the block whose first page is at `ptr` to the allocator,
    /// merging it with its buddy as many times as possible.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `ptr` is outside the managed
    /// region or not page-aligned, and [`Error::DoubleFree`] if the page at
    /// `ptr` is not currently allocated. A rejected call does not modify the
    /// allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a call to [`allocate`] on this
    /// allocator, and the caller must not access the block's memory after
    /// this call.
    ///
    /// [`allocate`]: Self::allocate
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Error> {
        let addr = ptr.addr();
        if !self.base.contains_addr(addr) {
            return Err(Error::InvalidArgument);
        }

        let offset = self.base.offset_to(addr);
        if offset % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }

        let mut index = offset / PAGE_SIZE;
        if !self.table.is_allocated(index) {
            return Err(Error::DoubleFree);
        }

        let mut rank = self.table.rank(index);
        debug_assert_eq!(
            index % pages_for_rank(rank),
            0,
            "allocated block start unaligned for its rank"
        );

        // Merge upward while the buddy is free and of equal rank. The buddy
        // of a block is the unique neighbor whose index differs by exactly
        // the block's own size in pages.
        while rank < MAX_RANK {
            let pages = pages_for_rank(rank);
            let buddy_index = index ^ pages;

            if buddy_index + pages > self.page_count {
                break;
            }

            if self.table.is_allocated(buddy_index) || self.table.rank(buddy_index) != rank {
                break;
            }

            let buddy = self.addr_of_index(buddy_index);
            unsafe { self.free_lists[rank - 1].remove(self.base, buddy) };

            // The merged block starts at the lower of the two indices.
            index &= !pages;
            rank += 1;
        }

        let block = self.addr_of_index(index);
        unsafe { self.free_lists[rank - 1].push(self.base, block) };
        self.table.set_block(index, rank, false);

        Ok(())
    }

    /// Returns the rank of the block owning the page at `ptr`.
    ///
    /// The page may belong to a free or an allocated block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `ptr` is outside the managed
    /// region.
    pub fn rank_of(&self, ptr: NonNull<u8>) -> Result<usize, Error> {
        let addr = ptr.addr();
        if !self.base.contains_addr(addr) {
            return Err(Error::InvalidArgument);
        }

        Ok(self.table.rank(self.base.offset_to(addr) / PAGE_SIZE))
    }

    /// Returns the number of free blocks of exactly `rank`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `rank` is outside
    /// `1..=MAX_RANK`.
    pub fn free_count(&self, rank: usize) -> Result<usize, Error> {
        if !(1..=MAX_RANK).contains(&rank) {
            return Err(Error::InvalidArgument);
        }

        Ok(self.free_lists[rank - 1].len(self.base))
    }

    /// Returns the number of pages managed by this allocator.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Returns a pointer to the base of the managed region.
    ///
    /// Page `i` starts `i * PAGE_SIZE` bytes past this pointer.
    pub fn region(&self) -> NonNull<u8> {
        self.base.ptr()
    }

    /// Decomposes the allocator into its raw components.
    ///
    /// The returned tuple contains the region pointer and the metadata
    /// pointer.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is
    /// called; the returned region pointer becomes the sole owner of the
    /// region that was used to construct the allocator. As such, all
    /// allocations made from this allocator should be either freed or
    /// forgotten before calling this method.
    pub unsafe fn into_raw_parts(self) -> (NonNull<u8>, NonNull<u8>) {
        let this = mem::ManuallyDrop::new(self);

        (this.base.ptr(), this.metadata)
    }

    #[inline]
    fn index_of(&self, addr: NonZeroUsize) -> usize {
        self.base.offset_to(addr) / PAGE_SIZE
    }

    #[inline]
    fn addr_of_index(&self, index: usize) -> NonZeroUsize {
        let offset = index.checked_mul(PAGE_SIZE).unwrap();

        NonZeroUsize::new(self.base.addr().get().checked_add(offset).unwrap()).unwrap()
    }
}

impl<A: BackingAllocator> Drop for PageBuddy<A> {
    fn drop(&mut self) {
        let region_layout = Self::region_layout(self.page_count);
        let metadata_layout = Self::metadata_layout(self.page_count);

        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), region_layout);
            self.backing_allocator
                .deallocate(self.metadata, metadata_layout);
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for PageBuddy<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuddy")
            .field("base", &self.base)
            .field("page_count", &self.page_count)
            .finish_non_exhaustive()
    }
}

/// Like a `PageBuddy`, but without a `Drop` impl or an associated allocator.
///
/// This assists in tacking on the allocator type parameter because this
/// struct can be moved out of, while `PageBuddy` itself cannot.
struct PageBuddyParts {
    base: BasePtr,
    metadata: NonNull<u8>,
    page_count: usize,
    table: PageTable,
    free_lists: [FreeList; MAX_RANK],
}

impl PageBuddyParts {
    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> PageBuddy<A> {
        let PageBuddyParts {
            base,
            metadata,
            page_count,
            table,
            free_lists,
        } = self;

        PageBuddy {
            base,
            metadata,
            page_count,
            table,
            free_lists,
            backing_allocator,
        }
    }

    /// Constructs a new `PageBuddyParts` from raw pointers.
    ///
    /// # Safety
    ///
    /// Same as [`PageBuddy::new_raw`].
    unsafe fn new(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
        page_count: usize,
    ) -> Result<PageBuddyParts, AllocInitError> {
        let extent = match page_count.checked_mul(PAGE_SIZE) {
            Some(e) if page_count > 0 => e,
            _ => return Err(AllocInitError::InvalidConfig),
        };

        let base = BasePtr::new(region, extent);
        let mut table = unsafe { PageTable::new(page_count, metadata) };
        let mut free_lists = [FreeList::EMPTY; MAX_RANK];

        // Greedily cover the region with the largest aligned blocks that
        // fit, from the lowest address upward. Each set bit of `page_count`
        // yields one block, largest first, capped at MAX_RANK.
        let mut index = 0;
        let mut blocks = 0;
        while index < page_count {
            let remaining = page_count - index;
            let rank = usize::min(
                usize::BITS as usize - remaining.leading_zeros() as usize,
                MAX_RANK,
            );

            let offset = index.checked_mul(PAGE_SIZE).unwrap();
            let block = NonZeroUsize::new(base.addr().get().checked_add(offset).unwrap()).unwrap();

            unsafe { free_lists[rank - 1].push(base, block) };
            table.set_block(index, rank, false);

            index += pages_for_rank(rank);
            blocks += 1;
        }

        log::debug!("installed region of {page_count} pages as {blocks} free blocks");

        Ok(PageBuddyParts {
            base,
            metadata,
            page_count,
            table,
            free_lists,
        })
    }
}
