//! A self-hosting binary-buddy allocator for kernel physical memory.
//!
//! [`Buddy`] manages one contiguous range of memory and hands out blocks
//! whose sizes are power-of-two multiples of a fixed leaf size. Freed blocks
//! are coalesced with their buddies back into larger blocks. All bookkeeping
//! (the per-class free lists and allocation bitmaps) lives inside the managed
//! range itself, so the allocator needs nothing but the range to start.
//!
//! For shared use, wrap the allocator in a [`SpinBuddy`]; every operation
//! then runs under one spin lock.
//!
//! ```
//! use core::{num::NonZeroUsize, ptr::NonNull};
//!
//! use kbuddy::{Buddy, Raw, SpinBuddy};
//!
//! // Leaf blocks of 64 bytes, at most 16 size classes.
//! type PhysAlloc = Buddy<64, 16, Raw>;
//!
//! let mut memory = vec![0_u64; 8192 / 8];
//! let base = NonNull::new(memory.as_mut_ptr().cast::<u8>()).unwrap();
//! let end = NonZeroUsize::new(base.as_ptr() as usize + 8192).unwrap();
//!
//! let heap = SpinBuddy::new(unsafe { PhysAlloc::new_raw(base, end) }.unwrap());
//!
//! let block = heap.allocate(100).unwrap();
//! assert_eq!(block.len(), 128);
//! assert_eq!(heap.rounded_size(100), 128);
//!
//! unsafe { heap.free(block.cast()) };
//! ```

#![doc(html_root_url = "https://docs.rs/kbuddy/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` to shadow methods that newer toolchains
// provide inherently.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
pub mod buddy;
mod free_list;
mod polyfill;
mod size_class;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::buddy::{Buddy, Dump, RefCellBuddy, SpinBuddy, Stats};

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory for the managed region, but the underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when the managed range is too small to hold
    /// one leaf block plus the allocator's own metadata, or when it needs
    /// more size classes than the allocator type permits.
    InvalidConfig,

    /// The location of the managed range is invalid.
    ///
    /// This variant is returned when the range ends before it starts, or when
    /// the power-of-two span covering it would extend past the end of the
    /// address space.
    InvalidLocation,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate a region of {} bytes aligned to {}",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
            AllocInitError::InvalidLocation => f.write_str("invalid region location"),
        }
    }
}

#[cfg(feature = "std")]
#[cfg_attr(docs_rs, doc(cfg(feature = "std")))]
impl std::error::Error for AllocInitError {}

/// Indicates an allocation failure due to resource exhaustion or an
/// unsatisfiable request size.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no free block large enough")
    }
}

#[cfg(feature = "std")]
#[cfg_attr(docs_rs, doc(cfg(feature = "std")))]
impl std::error::Error for AllocError {}

/// Types which provide memory which backs an allocator.
///
/// This trait is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by another
///   allocator. This is the case when constructing the allocator from raw
///   pointers, as a kernel does with the physical memory it finds at boot.
///   The memory is never returned.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this allocator, and
    /// * `layout` must fit that block of memory.
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
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
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
