//! Intrusive doubly-linked lists of free blocks.
//!
//! The links live in the first bytes of each free block, so a list never
//! needs storage of its own beyond the head address. A block's payload is
//! never read while it is on a list, and a list operation must never be
//! performed on a block that has been handed out.

use core::num::NonZeroUsize;

use crate::base::{BasePtr, BlockLink};

/// A list of free blocks, threaded through the blocks themselves.
#[derive(Debug, Default)]
pub struct FreeList {
    head: Option<NonZeroUsize>,
}

impl FreeList {
    pub const fn new() -> FreeList {
        FreeList { head: None }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Pushes a block onto the head of the list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be within the provenance of `base`, aligned for
    ///   `BlockLink` and valid for reads and writes for
    ///   `size_of::<BlockLink>()` bytes.
    /// - `block` must be free and not already present in any list.
    /// - Every block in `self` must have been pushed with the same `base`.
    pub unsafe fn push(&mut self, base: BasePtr, block: NonZeroUsize) {
        assert_eq!(block.get() % core::mem::align_of::<BlockLink>(), 0);

        let old_head = self.head;

        if let Some(old_head) = old_head {
            unsafe { base.link_mut(old_head).prev = Some(block) };
        }

        unsafe {
            base.init_link_at(
                block,
                BlockLink {
                    prev: None,
                    next: old_head,
                },
            )
        };

        self.head = Some(block);
    }

    /// Pops the block at the head of the list.
    ///
    /// If the list is empty, returns `None`.
    ///
    /// # Safety
    ///
    /// Every block in `self` must have been pushed with the same `base`.
    pub unsafe fn pop(&mut self, base: BasePtr) -> Option<NonZeroUsize> {
        let head = self.head?;

        unsafe { self.remove(base, head) };

        Some(head)
    }

    /// Removes the specified block from the list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be an element of `self`.
    /// - Every block in `self` must have been pushed with the same `base`.
    pub unsafe fn remove(&mut self, base: BasePtr, block: NonZeroUsize) {
        unsafe {
            let removed = base.link_mut(block);
            let (prev, next) = (removed.prev.take(), removed.next.take());

            match prev {
                // Link `prev` forward to `next`.
                Some(p) => base.link_mut(p).next = next,

                // If there's no previous block, then `removed` is the head of
                // the list.
                None => {
                    debug_assert_eq!(self.head, Some(block), "removed block not in list");
                    self.head = next;
                }
            }

            if let Some(n) = next {
                // Link `next` back to `prev`.
                base.link_mut(n).prev = prev;
            }
        }
    }

    /// Returns an iterator over the addresses of the blocks in the list.
    ///
    /// # Safety
    ///
    /// Every block in `self` must have been pushed with the same `base`, and
    /// the list must not be modified while the iterator is alive.
    pub unsafe fn iter(&self, base: BasePtr) -> Iter {
        Iter {
            base,
            cur: self.head,
        }
    }
}

/// Iterator over the blocks of a [`FreeList`].
pub struct Iter {
    base: BasePtr,
    cur: Option<NonZeroUsize>,
}

impl Iterator for Iter {
    type Item = NonZeroUsize;

    fn next(&mut self) -> Option<NonZeroUsize> {
        let cur = self.cur?;

        // SAFETY: `FreeList::iter`'s contract guarantees that `cur` holds an
        // initialized link within the region of `base`.
        self.cur = unsafe { self.base.link_mut(cur).next };

        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::ptr::NonNull;
    use std::prelude::rust_2021::*;

    use super::*;

    const BLOCK: usize = 16;

    fn with_region<F: FnOnce(BasePtr)>(num_blocks: usize, f: F) {
        let mut buf = vec_of_links(num_blocks);
        let ptr = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        f(BasePtr::new(ptr, num_blocks * BLOCK));
    }

    fn vec_of_links(num_blocks: usize) -> Vec<[u64; BLOCK / 8]> {
        let mut v = Vec::with_capacity(num_blocks);
        v.resize(num_blocks, [0; BLOCK / 8]);
        v
    }

    fn contents(list: &FreeList, base: BasePtr) -> Vec<usize> {
        unsafe { list.iter(base) }
            .map(|addr| base.offset_to(addr) / BLOCK)
            .collect()
    }

    #[test]
    fn push_pop_is_lifo() {
        with_region(4, |base| {
            let mut list = FreeList::new();
            assert!(list.is_empty());
            assert!(unsafe { list.pop(base) }.is_none());

            for i in 0..4 {
                unsafe { list.push(base, base.addr_at(i * BLOCK)) };
            }
            assert_eq!(contents(&list, base), [3, 2, 1, 0]);

            for i in (0..4).rev() {
                let block = unsafe { list.pop(base) }.unwrap();
                assert_eq!(base.offset_to(block), i * BLOCK);
            }
            assert!(list.is_empty());
        });
    }

    #[test]
    fn remove_head_middle_and_tail() {
        with_region(5, |base| {
            let mut list = FreeList::new();
            for i in 0..5 {
                unsafe { list.push(base, base.addr_at(i * BLOCK)) };
            }

            // Middle.
            unsafe { list.remove(base, base.addr_at(2 * BLOCK)) };
            assert_eq!(contents(&list, base), [4, 3, 1, 0]);

            // Head.
            unsafe { list.remove(base, base.addr_at(4 * BLOCK)) };
            assert_eq!(contents(&list, base), [3, 1, 0]);

            // Tail.
            unsafe { list.remove(base, base.addr_at(0)) };
            assert_eq!(contents(&list, base), [3, 1]);

            // Removed blocks can be pushed again.
            unsafe { list.push(base, base.addr_at(2 * BLOCK)) };
            assert_eq!(contents(&list, base), [2, 3, 1]);

            unsafe {
                list.remove(base, base.addr_at(3 * BLOCK));
                list.remove(base, base.addr_at(2 * BLOCK));
                list.remove(base, base.addr_at(BLOCK));
            }
            assert!(list.is_empty());
        });
    }
}
