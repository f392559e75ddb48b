#![cfg(test)]
extern crate std;

use core::{ptr::NonNull, slice};

use alloc::vec::Vec;
use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{
    bytes_for_rank, AllocInitError, Error, Global, PageBuddy, MAX_RANK, PAGE_SIZE,
};

fn new_pages(page_count: usize) -> PageBuddy<Global> {
    PageBuddy::try_new(page_count).unwrap()
}

/// Byte offset of `block` from the start of the managed region.
fn offset_of(pages: &PageBuddy<Global>, block: NonNull<u8>) -> usize {
    block.as_ptr() as usize - pages.region().as_ptr() as usize
}

fn free_counts(pages: &PageBuddy<Global>) -> Vec<usize> {
    (1..=MAX_RANK).map(|r| pages.free_count(r).unwrap()).collect()
}

#[test]
fn create_and_destroy() {
    let _ = new_pages(8);
}

#[test]
fn zero_pages_rejected() {
    assert!(matches!(
        PageBuddy::try_new(0),
        Err(AllocInitError::InvalidConfig)
    ));
}

#[test]
fn rank_bounds_are_checked() {
    let mut pages = new_pages(4);

    assert_eq!(pages.allocate(0), Err(Error::InvalidArgument));
    assert_eq!(pages.allocate(MAX_RANK + 1), Err(Error::InvalidArgument));
    assert_eq!(pages.free_count(0), Err(Error::InvalidArgument));
    assert_eq!(pages.free_count(MAX_RANK + 1), Err(Error::InvalidArgument));
}

#[test]
fn init_decomposition_matches_binary_representation() {
    // Each set bit of the page count yields one block, largest first.
    let pages = new_pages(7);
    assert_eq!(pages.free_count(1), Ok(1));
    assert_eq!(pages.free_count(2), Ok(1));
    assert_eq!(pages.free_count(3), Ok(1));
    for rank in 4..=MAX_RANK {
        assert_eq!(pages.free_count(rank), Ok(0));
    }

    let pages = new_pages(12);
    assert_eq!(pages.free_count(3), Ok(1));
    assert_eq!(pages.free_count(4), Ok(1));
    for rank in (1..=MAX_RANK).filter(|r| ![3, 4].contains(r)) {
        assert_eq!(pages.free_count(rank), Ok(0));
    }

    let pages = new_pages(1);
    assert_eq!(pages.free_count(1), Ok(1));
}

#[test]
fn allocations_have_requested_rank_and_alignment() {
    let mut pages = new_pages(16);

    for rank in 1..=5 {
        let block = pages.allocate(rank).unwrap();

        assert_eq!(pages.rank_of(block), Ok(rank));
        assert_eq!(offset_of(&pages, block) % bytes_for_rank(rank), 0);

        unsafe { pages.deallocate(block).unwrap() };
    }
}

#[test]
fn exhaustion_yields_exactly_page_count_singletons() {
    const PAGE_COUNT: usize = 8;

    let mut pages = new_pages(PAGE_COUNT);

    let mut blocks = Vec::new();
    for _ in 0..PAGE_COUNT {
        blocks.push(pages.allocate(1).unwrap());
    }

    assert_eq!(pages.allocate(1), Err(Error::OutOfMemory));

    // Every page was handed out exactly once.
    let mut offsets: Vec<usize> = blocks.iter().map(|b| offset_of(&pages, *b)).collect();
    offsets.sort_unstable();
    let expected: Vec<usize> = (0..PAGE_COUNT).map(|i| i * PAGE_SIZE).collect();
    assert_eq!(offsets, expected);

    for block in blocks {
        unsafe { pages.deallocate(block).unwrap() };
    }

    // Fully reclaimed: one maximal block again.
    assert_eq!(pages.free_count(4), Ok(1));
    for rank in (1..=MAX_RANK).filter(|r| *r != 4) {
        assert_eq!(pages.free_count(rank), Ok(0));
    }
}

#[test]
fn merge_happens_in_buddy_order() {
    let mut pages = new_pages(4);

    // Splitting hands out the four pages in address order.
    let a0 = pages.allocate(1).unwrap();
    let a1 = pages.allocate(1).unwrap();
    let a2 = pages.allocate(1).unwrap();
    let a3 = pages.allocate(1).unwrap();

    assert_eq!(offset_of(&pages, a0), 0);
    assert_eq!(offset_of(&pages, a1), PAGE_SIZE);
    assert_eq!(offset_of(&pages, a2), 2 * PAGE_SIZE);
    assert_eq!(offset_of(&pages, a3), 3 * PAGE_SIZE);

    unsafe {
        pages.deallocate(a1).unwrap();
        assert_eq!(pages.free_count(1), Ok(1));
        assert_eq!(pages.free_count(2), Ok(0));

        // Freeing page 0 merges pages [0, 2) into a rank-2 block.
        pages.deallocate(a0).unwrap();
        assert_eq!(pages.free_count(1), Ok(0));
        assert_eq!(pages.free_count(2), Ok(1));
        assert_eq!(pages.free_count(3), Ok(0));

        pages.deallocate(a3).unwrap();
        assert_eq!(pages.free_count(1), Ok(1));

        // The last free cascades: pages [2, 4) merge, then both rank-2
        // blocks merge into one rank-3 block covering the whole region.
        pages.deallocate(a2).unwrap();
        assert_eq!(pages.free_count(1), Ok(0));
        assert_eq!(pages.free_count(2), Ok(0));
        assert_eq!(pages.free_count(3), Ok(1));
    }
}

#[test]
fn non_buddies_never_merge() {
    // Three pages decompose into a rank-2 block at page 0 and a singleton at
    // page 2.
    let mut pages = new_pages(3);
    assert_eq!(pages.free_count(1), Ok(1));
    assert_eq!(pages.free_count(2), Ok(1));

    let a = pages.allocate(1).unwrap();
    let b = pages.allocate(1).unwrap();
    let c = pages.allocate(1).unwrap();

    assert_eq!(offset_of(&pages, a), 2 * PAGE_SIZE);
    assert_eq!(offset_of(&pages, b), 0);
    assert_eq!(offset_of(&pages, c), PAGE_SIZE);

    unsafe {
        // Pages 1 and 2 are adjacent and both free, but they are not
        // buddies: page 1 pairs with page 0, and page 2's buddy lies past
        // the end of the region.
        pages.deallocate(c).unwrap();
        pages.deallocate(a).unwrap();
        assert_eq!(pages.free_count(1), Ok(2));
        assert_eq!(pages.free_count(2), Ok(0));

        // Freeing page 0 merges it with page 1 and restores the initial
        // shape.
        pages.deallocate(b).unwrap();
        assert_eq!(pages.free_count(1), Ok(1));
        assert_eq!(pages.free_count(2), Ok(1));
    }
}

#[test]
fn double_free_is_rejected() {
    let mut pages = new_pages(4);

    let block = pages.allocate(1).unwrap();

    unsafe {
        pages.deallocate(block).unwrap();
        assert_eq!(pages.deallocate(block), Err(Error::DoubleFree));
    }

    // The failed free did not disturb the fully merged region.
    assert_eq!(pages.free_count(3), Ok(1));
    assert_eq!(pages.allocate(3).map(|b| offset_of(&pages, b)), Ok(0));
}

#[test]
fn invalid_addresses_are_rejected() {
    let mut pages = new_pages(4);

    let base = pages.region().as_ptr();
    let unaligned = NonNull::new(unsafe { base.add(1) }).unwrap();
    let past_end = NonNull::new(unsafe { base.add(4 * PAGE_SIZE) }).unwrap();

    unsafe {
        assert_eq!(pages.deallocate(unaligned), Err(Error::InvalidArgument));
        assert_eq!(pages.deallocate(past_end), Err(Error::InvalidArgument));
    }

    assert_eq!(pages.rank_of(past_end), Err(Error::InvalidArgument));
}

#[test]
fn balanced_sequences_restore_free_counts() {
    let mut pages = new_pages(13);
    let before = free_counts(&pages);

    let mut blocks = Vec::new();
    for rank in [1, 2, 1, 3, 1] {
        blocks.push(pages.allocate(rank).unwrap());
    }

    for index in [2, 0, 4, 1, 3] {
        unsafe { pages.deallocate(blocks[index]).unwrap() };
    }

    assert_eq!(free_counts(&pages), before);
}

#[test]
fn queries_are_pure() {
    let mut pages = new_pages(6);
    let block = pages.allocate(1).unwrap();

    let counts = free_counts(&pages);
    let rank = pages.rank_of(block);

    for _ in 0..3 {
        assert_eq!(free_counts(&pages), counts);
        assert_eq!(pages.rank_of(block), rank);
    }

    unsafe { pages.deallocate(block).unwrap() };
}

#[test]
fn alloc_write_and_free() {
    let mut pages = new_pages(8);

    let block = pages.allocate(2).unwrap();

    {
        // Do this in a separate scope so that the slice no longer exists
        // when the block is freed.
        let buf: &mut [u8] =
            unsafe { slice::from_raw_parts_mut(block.as_ptr(), bytes_for_rank(2)) };
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = (i % 256) as u8;
        }
    }

    unsafe { pages.deallocate(block).unwrap() };
}

// Property tests ==============================================================

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a block of the given rank.
    Allocate { rank: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size: ranks above this are exercised by the
/// deterministic tests.
const MAX_PROP_RANK: usize = 4;

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                rank: usize::arbitrary(g) % MAX_PROP_RANK + 1,
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

struct Allocation {
    id: u32,
    block: NonNull<u8>,
    rank: usize,
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

#[test]
fn allocations_are_mutually_exclusive() {
    fn prop(ops: Vec<AllocatorOp>) -> bool {
        let mut pages = new_pages(32);
        let initial = free_counts(&pages);

        let mut outstanding: Vec<Allocation> = Vec::with_capacity(ops.len());

        for (id, op) in ops.into_iter().enumerate() {
            let id = id as u32;

            match op {
                AllocatorOp::Allocate { rank } => {
                    let block = match pages.allocate(rank) {
                        Ok(b) => b,
                        Err(Error::OutOfMemory) => continue,
                        Err(_) => return false,
                    };

                    let words = bytes_for_rank(rank) / 4;
                    let buf: &mut [u32] =
                        unsafe { slice::from_raw_parts_mut(block.as_ptr().cast(), words) };
                    buf.fill(id);

                    outstanding.push(Allocation { id, block, rank });
                }

                AllocatorOp::Free { index } => {
                    if outstanding.is_empty() {
                        continue;
                    }

                    let a = outstanding.swap_remove(index % outstanding.len());

                    let words = bytes_for_rank(a.rank) / 4;
                    let buf: &[u32] =
                        unsafe { slice::from_raw_parts(a.block.as_ptr().cast(), words) };
                    if buf.iter().any(|&word| word != a.id) {
                        return false;
                    }

                    if unsafe { pages.deallocate(a.block) }.is_err() {
                        return false;
                    }
                }
            }
        }

        // Drain the survivors; full reclamation must restore the initial
        // free-list shape.
        for a in outstanding {
            if unsafe { pages.deallocate(a.block) }.is_err() {
                return false;
            }
        }

        free_counts(&pages) == initial
    }

    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(prop as fn(_) -> bool);
}

// Version sync ================================================================

#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
