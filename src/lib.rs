//! A buddy allocator for physical page frames.
//!
//! This crate manages a contiguous region of memory partitioned into
//! [`PAGE_SIZE`]-byte pages and hands out power-of-two-sized, aligned runs of
//! pages ("blocks") using the classic binary-buddy algorithm. Block sizes are
//! expressed as a *rank* in `1..=MAX_RANK`: a rank-`r` block spans
//! `2^(r - 1)` contiguous pages. Allocation splits larger free blocks down to
//! the requested rank; deallocation merges freed blocks with their buddies
//! back up, both in `O(MAX_RANK)` steps.
//!
//! The allocator stores its free lists inside the free pages themselves and
//! keeps a flat per-page side table (rank and allocated state) in a separate
//! metadata region, so it never allocates from anywhere else at runtime.
//!
//! # Examples
//!
//! ```
//! # #[cfg(feature = "alloc")] {
//! use page_buddy::PageBuddy;
//!
//! // Eight pages, with the region and metadata taken from the global heap.
//! let mut pages = PageBuddy::try_new(8).unwrap();
//!
//! // A rank-2 block spans two pages.
//! let block = pages.allocate(2).unwrap();
//! assert_eq!(pages.rank_of(block), Ok(2));
//!
//! unsafe { pages.deallocate(block).unwrap() };
//! # }
//! ```
#![doc(html_root_url = "https://docs.rs/page_buddy/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by unstable features.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

#[cfg(test)]
extern crate std;

mod base;
mod bitmap;
mod polyfill;
mod table;

pub mod buddy;

#[cfg(feature = "global")]
pub mod global;

#[cfg(test)]
mod tests;

use core::alloc::Layout;

use core::ptr::NonNull;

pub use crate::buddy::PageBuddy;

/// The size in bytes of a single page.
pub const PAGE_SIZE: usize = 4096;

/// The largest supported block rank, inclusive.
///
/// A rank-[`MAX_RANK`] block spans `2^(MAX_RANK - 1)` pages, which is 128 MiB
/// at the fixed page size.
pub const MAX_RANK: usize = 16;

/// Returns the number of pages spanned by a block of `rank`.
///
/// `rank` must be at least 1; rank 0 does not exist.
pub const fn pages_for_rank(rank: usize) -> usize {
    1 << (rank - 1)
}

/// Returns the size in bytes of a block of `rank`.
///
/// `rank` must be at least 1; rank 0 does not exist.
pub const fn bytes_for_rank(rank: usize) -> usize {
    pages_for_rank(rank) * PAGE_SIZE
}

/// The error type for allocator constructors.
#[derive(Clone, Debug)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory, either for metadata or the managed region, but the underlying
    /// allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when the requested page count is zero, or so
    /// large that the region or metadata size overflows a `usize`.
    InvalidConfig,

    /// A prior initialization already installed a region.
    ///
    /// Only the process-wide facade in the `global` module returns this; explicit
    /// [`PageBuddy`] instances are independent of one another.
    #[cfg(feature = "global")]
    AlreadyInitialized,
}

/// The error type for allocator operations.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Error {
    /// A rank was outside `1..=MAX_RANK`, or an address was outside the
    /// managed region or not page-aligned.
    InvalidArgument,

    /// No free block of sufficient rank exists.
    ///
    /// This is not transient from the allocator's point of view; it clears
    /// only when the caller frees memory.
    OutOfMemory,

    /// The page at the given address is not currently allocated.
    DoubleFree,

    /// The process-wide allocator has not been initialized.
    ///
    /// Only the `global` facade returns this.
    #[cfg(feature = "global")]
    Uninitialized,
}

/// Types which provide memory which backs an allocator.
///
/// This is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by
///   another allocator. This is the case when constructing the allocator from
///   raw pointers. Memory used by this allocator can be reclaimed using
///   `.into_raw_parts()`.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this
    /// allocator, and `layout` must fit that block of memory.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[cfg(any(feature = "alloc", test))]
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
