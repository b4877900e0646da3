#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::Arbitrary;
use buddy_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const LEAF_SIZE: usize = 64;
const MAX_CLASSES: usize = 16;

const MAX_SPAN: usize = 1 << 22;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    span: usize,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let subject = match BuddySubject::<LEAF_SIZE, MAX_CLASSES>::new(args.span % MAX_SPAN) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut evaluator = Evaluator::new(subject);
    if let Err(failed) = evaluator.evaluate(args.ops) {
        panic!("buddy allocator failed: {failed:?}");
    }
});
