#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use kbuddy::{AllocInitError, Buddy, Global, Stats};

/// A `Buddy` under evaluation, with its usage at construction.
pub struct BuddySubject<const LEAF_SIZE: usize, const MAX_CLASSES: usize> {
    buddy: Buddy<LEAF_SIZE, MAX_CLASSES, Global>,
    initial: Stats,
}

impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize> BuddySubject<LEAF_SIZE, MAX_CLASSES> {
    pub fn new(span: usize) -> Result<Self, AllocInitError> {
        let buddy = Buddy::try_new(span)?;
        let initial = buddy.stats();
        Ok(BuddySubject { buddy, initial })
    }
}

impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize> Subject
    for BuddySubject<LEAF_SIZE, MAX_CLASSES>
{
    type AllocError = kbuddy::AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.buddy.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe { self.buddy.free(ptr) };
    }

    fn check_quiescent(&self) -> bool {
        self.buddy.stats() == self.initial
    }
}
