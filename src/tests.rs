#![cfg(test)]
extern crate std;

use core::{ptr::NonNull, slice};

use crate::{AllocError, Buddy, Global, SpinBuddy};

use alloc::{boxed::Box, vec::Vec};
use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};

type QcBuddy = Buddy<16, 24, Global>;

#[derive(Clone, Debug)]
struct BuddyParams {
    span: usize,
}

impl Arbitrary for BuddyParams {
    fn arbitrary(g: &mut Gen) -> Self {
        // Small spans are mostly metadata, so bias toward useful sizes.
        BuddyParams {
            span: 256 + usize::arbitrary(g) % (1 << 16),
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        Box::new(
            self.span
                .shrink()
                .filter(|&span| span >= 256)
                .map(|span| BuddyParams { span }),
        )
    }
}

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a buffer that can hold `len` `u32` values.
    Allocate { len: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 14;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                len: limited_size(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

type OpId = u32;

/// An outstanding allocation, painted with the id of the op that made it.
struct Allocation {
    op_id: OpId,
    block: NonNull<[u8]>,
    len: usize,
}

impl Allocation {
    fn words(&self) -> &mut [u32] {
        unsafe { slice::from_raw_parts_mut(self.block.cast::<u32>().as_ptr(), self.len) }
    }

    fn paint(&self) {
        self.words().fill(self.op_id);
    }

    fn verify(&self) -> bool {
        self.words().iter().all(|&w| w == self.op_id)
    }
}

struct AllocatorChecker {
    buddy: QcBuddy,
    allocations: Vec<Allocation>,
    num_ops: u32,
}

impl AllocatorChecker {
    fn new(buddy: QcBuddy, capacity: usize) -> Self {
        AllocatorChecker {
            buddy,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
        }
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { len } => {
                let nbytes = len * 4;

                match self.buddy.allocate(nbytes) {
                    Ok(block) => {
                        if block.len() != QcBuddy::rounded_size(nbytes) || block.len() < nbytes {
                            return false;
                        }

                        // Blocks are aligned to their own size.
                        if self.buddy.offset_of(block.cast()) % block.len() != 0 {
                            return false;
                        }

                        let a = Allocation { op_id, block, len };
                        a.paint();
                        self.allocations.push(a);
                    }

                    Err(AllocError) => {
                        // Failure is only allowed when no free block is big
                        // enough.
                        if self.buddy.largest_free_block() >= QcBuddy::rounded_size(nbytes) {
                            return false;
                        }
                    }
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !a.verify() {
                    return false;
                }

                unsafe { self.buddy.free(a.block.cast()) };
            }
        }

        true
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for a in self.allocations.drain(..) {
            if !a.verify() {
                return false;
            }

            unsafe { self.buddy.free(a.block.cast()) };
        }

        true
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

fn allocations_are_mutually_exclusive(params: BuddyParams, ops: Vec<AllocatorOp>) -> TestResult {
    let buddy = match QcBuddy::try_new(params.span) {
        Ok(b) => b,
        Err(_) => return TestResult::discard(),
    };

    let mut checker = AllocatorChecker::new(buddy, ops.len());
    TestResult::from_bool(checker.run(ops))
}

fn freeing_everything_restores_free_bytes(
    params: BuddyParams,
    ops: Vec<AllocatorOp>,
) -> TestResult {
    let buddy = match QcBuddy::try_new(params.span) {
        Ok(b) => b,
        Err(_) => return TestResult::discard(),
    };

    let initial = buddy.stats();
    if initial.total != initial.metadata + initial.unavailable + initial.free {
        return TestResult::failed();
    }

    let mut checker = AllocatorChecker::new(buddy, ops.len());
    if !checker.run(ops) {
        return TestResult::failed();
    }

    TestResult::from_bool(checker.buddy.stats() == initial)
}

fn rounded_size_covers_request(nbytes: usize) -> TestResult {
    let nbytes = nbytes % (1 << 40);
    let r = QcBuddy::rounded_size(nbytes);

    TestResult::from_bool(r >= nbytes && r >= 16 && r.is_power_of_two() && (r == 16 || r / 2 < nbytes))
}

#[test]
fn buddy_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(allocations_are_mutually_exclusive as fn(_, _) -> TestResult);
}

#[test]
fn buddy_free_bytes_are_restored() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(freeing_everything_restores_free_bytes as fn(_, _) -> TestResult);
}

#[test]
fn buddy_rounded_size() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(rounded_size_covers_request as fn(_) -> TestResult);
}

#[test]
fn spin_buddy_across_threads() {
    const THREADS: u32 = 4;
    const ROUNDS: u32 = 200;

    let buddy = SpinBuddy::new(Buddy::<64, 24, Global>::try_new(1 << 20).unwrap());
    let initial = buddy.stats();

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let buddy = &buddy;
            s.spawn(move || {
                let mut held = Vec::new();
                for round in 0..ROUNDS {
                    let len = 1 + ((t * 31 + round * 7) % 200) as usize;
                    let block = buddy.allocate(len * 4).unwrap();
                    let a = Allocation {
                        op_id: t << 16 | round,
                        block,
                        len,
                    };
                    a.paint();
                    held.push(a);

                    if round % 3 == 2 {
                        let a = held.swap_remove(round as usize % held.len());
                        assert!(a.verify());
                        unsafe { buddy.free(a.block.cast()) };
                    }
                }

                for a in held {
                    assert!(a.verify());
                    unsafe { buddy.free(a.block.cast()) };
                }
            });
        }
    });

    assert_eq!(buddy.stats(), initial);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
