#![no_main]

use std::ptr::NonNull;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use page_buddy::{Error, PageBuddy, MAX_RANK};

const MAX_FUZZ_PAGES: usize = 256;
const MAX_FUZZ_RANK: usize = 6;

#[derive(Clone, Debug, Arbitrary)]
enum PagesOp {
    Allocate { rank: u8 },
    Free { index: usize },
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    page_count: u16,
    ops: Vec<PagesOp>,
}

fn free_counts<A: page_buddy::BackingAllocator>(pages: &PageBuddy<A>) -> Vec<usize> {
    (1..=MAX_RANK)
        .map(|rank| pages.free_count(rank).unwrap())
        .collect()
}

fuzz_target!(|args: Args| {
    let page_count = usize::from(args.page_count) % MAX_FUZZ_PAGES + 1;

    let mut pages = match PageBuddy::try_new(page_count) {
        Ok(p) => p,
        Err(_) => return,
    };

    let initial = free_counts(&pages);

    let mut outstanding: Vec<(NonNull<u8>, u32)> = Vec::new();

    for (id, op) in args.ops.into_iter().enumerate() {
        let id = id as u32;

        match op {
            PagesOp::Allocate { rank } => {
                let rank = usize::from(rank) % MAX_FUZZ_RANK + 1;

                match pages.allocate(rank) {
                    Ok(block) => {
                        // Tag the block; the tag must survive until the
                        // block is freed.
                        unsafe { block.as_ptr().cast::<u32>().write(id) };
                        outstanding.push((block, id));
                    }
                    Err(Error::OutOfMemory) => (),
                    Err(err) => panic!("allocate({rank}): {err:?}"),
                }
            }

            PagesOp::Free { index } => {
                if outstanding.is_empty() {
                    continue;
                }

                let (block, id) = outstanding.swap_remove(index % outstanding.len());

                assert_eq!(unsafe { block.as_ptr().cast::<u32>().read() }, id);
                unsafe { pages.deallocate(block).unwrap() };
            }
        }
    }

    // Drain the survivors; full reclamation must restore the initial
    // free-list shape.
    for (block, id) in outstanding {
        assert_eq!(unsafe { block.as_ptr().cast::<u32>().read() }, id);
        unsafe { pages.deallocate(block).unwrap() };
    }

    assert_eq!(free_counts(&pages), initial);
});
