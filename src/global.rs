//! A process-wide page allocator.
//!
//! This module serves deployments that want the allocator as ambient state
//! rather than an explicit instance: one [`PageBuddy`] is installed over a
//! caller-supplied region by [`init`] and every operation is forwarded to it
//! behind a single [`spin::Mutex`], which serializes the multi-step free-list
//! and table mutations as the allocator requires. Each call is a bounded,
//! non-yielding critical section.
//!
//! The metadata for the instance lives in a static store sized for
//! [`MAX_PAGES`] pages, so initialization needs no memory beyond the managed
//! region itself.

use core::ptr::NonNull;

use spin::Mutex;

use crate::{AllocInitError, Error, PageBuddy, Raw};

/// The largest region the process-wide allocator can manage, in pages.
pub const MAX_PAGES: usize = 32 * 1024;

// One rank byte per page plus one allocated bit per page. This covers
// `PageBuddy::metadata_layout(n)` for any `n` up to MAX_PAGES.
const METADATA_BYTES: usize = MAX_PAGES + MAX_PAGES / 8;

#[repr(C, align(8))]
struct MetadataStore([u8; METADATA_BYTES]);

struct Slot {
    pages: Option<PageBuddy<Raw>>,
    store: MetadataStore,
}

// SAFETY: the pointers held by the installed allocator refer to the
// caller-provided region and to `store`; access to both is serialized by the
// enclosing mutex.
unsafe impl Send for Slot {}

static SLOT: Mutex<Slot> = Mutex::new(Slot {
    pages: None,
    store: MetadataStore([0; METADATA_BYTES]),
});

/// Installs the process-wide allocator over `page_count` pages starting at
/// `region`.
///
/// The region is owned by the allocator for the remaining process lifetime;
/// there is no teardown operation.
///
/// # Errors
///
/// Returns [`AllocInitError::AlreadyInitialized`] if a prior call already
/// installed a region, and [`AllocInitError::InvalidConfig`] if `page_count`
/// is zero or exceeds [`MAX_PAGES`].
///
/// # Safety
///
/// `region` must satisfy the [`Layout`] returned by
/// [`PageBuddy::region_layout(page_count)`], must be valid for reads and
/// writes for the entire size indicated by that `Layout`, and must not be
/// accessed except through this module for the remaining process lifetime.
///
/// [`Layout`]: core::alloc::Layout
/// [`PageBuddy::region_layout(page_count)`]: PageBuddy::region_layout
pub unsafe fn init(region: NonNull<u8>, page_count: usize) -> Result<(), AllocInitError> {
    let mut slot = SLOT.lock();

    if slot.pages.is_some() {
        return Err(AllocInitError::AlreadyInitialized);
    }

    if page_count == 0 || page_count > MAX_PAGES {
        return Err(AllocInitError::InvalidConfig);
    }

    let metadata = NonNull::new(slot.store.0.as_mut_ptr()).unwrap();
    let pages = unsafe { PageBuddy::new_raw(metadata, region, page_count)? };

    slot.pages = Some(pages);
    log::debug!("process-wide page allocator initialized ({page_count} pages)");

    Ok(())
}

/// Allocates a block of `rank` from the process-wide allocator.
///
/// See [`PageBuddy::allocate`].
///
/// # Errors
///
/// Returns [`Error::Uninitialized`] if [`init`] has not succeeded, otherwise
/// as [`PageBuddy::allocate`].
pub fn allocate(rank: usize) -> Result<NonNull<u8>, Error> {
    SLOT.lock()
        .pages
        .as_mut()
        .ok_or(Error::Uninitialized)?
        .allocate(rank)
}

/// Returns a block to the process-wide allocator.
///
/// See [`PageBuddy::deallocate`].
///
/// # Errors
///
/// Returns [`Error::Uninitialized`] if [`init`] has not succeeded, otherwise
/// as [`PageBuddy::deallocate`].
///
/// # Safety
///
/// `ptr` must have been returned by [`allocate`], and the caller must not
/// access the block's memory after this call.
pub unsafe fn deallocate(ptr: NonNull<u8>) -> Result<(), Error> {
    unsafe {
        SLOT.lock()
            .pages
            .as_mut()
            .ok_or(Error::Uninitialized)?
            .deallocate(ptr)
    }
}

/// Returns the rank of the block owning the page at `ptr`.
///
/// See [`PageBuddy::rank_of`].
///
/// # Errors
///
/// Returns [`Error::Uninitialized`] if [`init`] has not succeeded, otherwise
/// as [`PageBuddy::rank_of`].
pub fn rank_of(ptr: NonNull<u8>) -> Result<usize, Error> {
    SLOT.lock()
        .pages
        .as_ref()
        .ok_or(Error::Uninitialized)?
        .rank_of(ptr)
}

/// Returns the number of free blocks of exactly `rank`.
///
/// See [`PageBuddy::free_count`].
///
/// # Errors
///
/// Returns [`Error::Uninitialized`] if [`init`] has not succeeded, otherwise
/// as [`PageBuddy::free_count`].
pub fn free_count(rank: usize) -> Result<usize, Error> {
    SLOT.lock()
        .pages
        .as_ref()
        .ok_or(Error::Uninitialized)?
        .free_count(rank)
}
