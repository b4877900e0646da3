//! Strict-provenance polyfills.
//!
//! Pointer address manipulation goes through the `sptr` crate so that older
//! toolchains get the same provenance-preserving API as current ones.

#![cfg(feature = "sptr")]

use core::{num::NonZeroUsize, ptr::NonNull};

pub use sptr::Strict;

pub trait NonNullStrict<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: The pointer is guaranteed by the type to be non-null,
        // meaning that the address will be non-zero.
        unsafe { NonZeroUsize::new_unchecked(Strict::addr(self.as_ptr())) }
    }

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized,
    {
        // SAFETY: The result of `Strict::with_addr` is non-null because `addr`
        // is guaranteed to be non-zero.
        unsafe { NonNull::new_unchecked(Strict::with_addr(self.as_ptr(), addr.get())) }
    }
}
