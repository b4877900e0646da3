use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

#[cfg(feature = "sptr")]
use crate::polyfill::{NonNullStrict, Strict};

/// A pointer to the base of the region of memory managed by an allocator.
///
/// Every pointer handed out by the allocator, and every pointer used to
/// reach a free-list link, is derived from this one so that it carries the
/// provenance of the whole region.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        ptr.addr()
            .get()
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn limit(self) -> NonZeroUsize {
        NonZeroUsize::new(self.ptr.addr().get() + self.extent).unwrap()
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr < self.limit()
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    /// Calculates the offset from `self` to `block`.
    #[inline]
    pub fn offset_to(self, block: NonZeroUsize) -> usize {
        block.get().checked_sub(self.ptr.addr().get()).unwrap()
    }

    /// Calculates the address `offset` bytes past `self`.
    #[inline]
    pub fn addr_at(self, offset: usize) -> NonZeroUsize {
        let addr = self
            .ptr
            .addr()
            .get()
            .checked_add(offset)
            .and_then(NonZeroUsize::new)
            .unwrap();

        debug_assert!(self.contains_addr(addr));

        addr
    }

    /// Initializes a `BlockLink` at the given address.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `BlockLink` values.
    /// - The memory at `addr` must be within the provenance of `self` and valid
    ///   for reads and writes for `size_of::<BlockLink>()` bytes.
    /// - The memory at `addr` must be unallocated by the associated allocator.
    #[inline]
    pub unsafe fn init_link_at(self, addr: NonZeroUsize, link: BlockLink) {
        debug_assert!(self.contains_addr(addr));

        debug_assert!(
            link.next.map_or(true, |next| self.contains_addr(next)),
            "next link out of region"
        );
        debug_assert!(
            link.prev.map_or(true, |prev| self.contains_addr(prev)),
            "prev link out of region"
        );

        unsafe {
            self.with_addr(addr)
                .cast::<BlockLink>()
                .as_ptr()
                .write(link)
        };
    }

    /// Returns a mutable reference to the `BlockLink` at `link`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `link` must be a properly aligned address for `BlockLink` values.
    /// - The memory at `link` must contain a properly initialized `BlockLink` value.
    /// - The memory at `link` must be within the provenance of `self` and
    ///   unallocated by the associated allocator.
    #[inline]
    pub unsafe fn link_mut<'a>(self, link: NonZeroUsize) -> &'a mut BlockLink {
        debug_assert!(self.contains_addr(link));

        let link = unsafe { self.ptr.with_addr(link).cast::<BlockLink>().as_mut() };

        debug_assert!(
            link.next.map_or(true, |next| self.contains_addr(next)),
            "next link out of region"
        );
        debug_assert!(
            link.prev.map_or(true, |prev| self.contains_addr(prev)),
            "prev link out of region"
        );

        link
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        self.ptr.with_addr(addr)
    }

    #[inline]
    pub fn with_addr_and_size(self, addr: NonZeroUsize, len: usize) -> NonNull<[u8]> {
        debug_assert!(self.contains_addr(addr));

        let ptr = self.ptr.as_ptr().with_addr(addr.get());
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr, len);

        unsafe { NonNull::new_unchecked(raw_slice) }
    }

    /// Creates a new pointer with the given offset.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, offset: usize) -> NonNull<u8> {
        self.with_addr(self.addr_at(offset))
    }
}

// Rather than using pointers, store only the addresses of the previous and
// next links.  This avoids accidentally violating stacked borrows; the
// links "point to" other blocks, but by forgoing actual pointers, no borrow
// is implied.
//
// NOTE: Using this method, any actual pointer to a block must be acquired
// via the allocator base pointer, and NOT by casting these addresses
// directly!

/// A double link in a linked list of blocks of memory.
///
/// This type is meant to be embedded in the block itself, forming an intrusive
/// doubly linked list.
#[repr(C)]
#[derive(Debug)]
pub struct BlockLink {
    pub prev: Option<NonZeroUsize>,
    pub next: Option<NonZeroUsize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_round_trip_through_addresses() {
        let mut buf = [0u64; 8];
        let ptr = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        let base = BasePtr::new(ptr, 64);

        for ofs in [0, 8, 16, 63] {
            let addr = base.addr_at(ofs);
            assert!(base.contains_addr(addr));
            assert_eq!(base.offset_to(addr), ofs);
        }

        assert!(!base.contains_addr(base.limit()));
    }
}
