use core::{alloc::Layout, ops::Range};

/// A packed array of bits backed by a borrowed byte buffer.
pub struct Bitmap {
    num_bits: usize,
    map: *mut u8,
}

impl Bitmap {
    pub fn map_layout(num_bits: usize) -> Layout {
        Layout::array::<u8>(Self::num_bytes(num_bits)).expect("bitmap metadata layout error")
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`.
    ///
    /// Every bit in the returned bitmap is clear.
    ///
    /// A `Layout` describing a suitable region for `map` can be obtained with
    /// `Bitmap::map_layout(num_bits)`.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for
    ///   `Bitmap::num_bytes(num_bits)` many bytes.
    /// - No other live reference or bitmap may access those bytes while the
    ///   returned bitmap exists.
    pub unsafe fn new(num_bits: usize, map: *mut u8) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!map.is_null());

        unsafe { map.write_bytes(0, Self::num_bytes(num_bits)) };

        Bitmap { num_bits, map }
    }

    #[inline]
    pub fn num_bytes(num_bits: usize) -> usize {
        num_bits.checked_add(7).unwrap() / 8
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Returns a tuple of the index of the byte containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u8) {
        (bit / 8, 1 << (bit % 8))
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (byte_idx, mask) = Self::index_and_mask(index);

        unsafe { self.map.add(byte_idx).read() & mask != 0 }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (byte_idx, mask) = Self::index_and_mask(index);

        unsafe {
            let byte_ptr = self.map.add(byte_idx);
            let byte = byte_ptr.read();
            byte_ptr.write(match value {
                true => byte | mask,
                false => byte & !mask,
            });
        }
    }

    /// Returns an iterator over the maximal runs of set bits.
    pub fn ranges(&self) -> Ranges<'_> {
        Ranges {
            bitmap: self,
            cur: 0,
        }
    }
}

/// Iterator over the runs of set bits in a [`Bitmap`].
pub struct Ranges<'a> {
    bitmap: &'a Bitmap,
    cur: usize,
}

impl Iterator for Ranges<'_> {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Range<usize>> {
        let len = self.bitmap.len();

        let start = (self.cur..len).find(|&i| self.bitmap.get(i))?;
        let end = (start..len)
            .find(|&i| !self.bitmap.get(i))
            .unwrap_or(len);

        self.cur = end;
        Some(start..end)
    }
}
