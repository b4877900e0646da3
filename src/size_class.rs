//! Size-class arithmetic.
//!
//! Class `k` holds blocks of `leaf_size << k` bytes. The managed region is
//! always modeled as exactly one block of the top class, even when the
//! physical range backing it is shorter.

/// The size classes covering one managed region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SizeClasses {
    leaf_size: usize,
    num_classes: usize,
}

impl SizeClasses {
    /// Computes the classes needed to cover `span` bytes with blocks of at
    /// least `leaf_size` bytes.
    ///
    /// Returns `None` if `span` is smaller than one leaf, or if the top block
    /// size would overflow a `usize`.
    ///
    /// # Panics
    ///
    /// Panics if `leaf_size` is not a power of two.
    pub fn for_span(leaf_size: usize, span: usize) -> Option<SizeClasses> {
        assert!(leaf_size.is_power_of_two(), "leaf size must be a power of two");

        let leaves = span / leaf_size;
        if leaves == 0 {
            return None;
        }

        let mut num_classes = leaves.ilog2() as usize + 1;
        let top = Self::checked_block_size(leaf_size, num_classes - 1)?;
        if span > top {
            // Round up so the top block covers the whole span.
            num_classes += 1;
            Self::checked_block_size(leaf_size, num_classes - 1)?;
        }

        Some(SizeClasses {
            leaf_size,
            num_classes,
        })
    }

    fn checked_block_size(leaf_size: usize, class: usize) -> Option<usize> {
        let factor = 1_usize.checked_shl(class.try_into().ok()?)?;
        leaf_size.checked_mul(factor)
    }

    /// Returns the smallest class whose blocks hold at least `nbytes` bytes.
    ///
    /// The result does not depend on the number of classes, and may exceed
    /// it. Returns `None` if no power-of-two block can hold `nbytes`.
    pub fn class_for(leaf_size: usize, nbytes: usize) -> Option<usize> {
        if nbytes <= leaf_size {
            return Some(0);
        }

        let size = nbytes.checked_next_power_of_two()?;
        Some((size / leaf_size).trailing_zeros() as usize)
    }

    #[inline]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.num_classes - 1
    }

    /// Returns the size of the single top-class block.
    #[inline]
    pub fn top_span(&self) -> usize {
        self.block_size(self.top())
    }

    #[inline]
    pub fn block_size(&self, class: usize) -> usize {
        assert!(class < self.num_classes, "size class exceeds table");
        self.leaf_size << class
    }

    #[inline]
    pub fn block_count(&self, class: usize) -> usize {
        assert!(class < self.num_classes, "size class exceeds table");
        1 << (self.top() - class)
    }

    /// Returns the index of the class-`class` block containing `ofs`.
    #[inline]
    pub fn index(&self, class: usize, ofs: usize) -> usize {
        ofs / self.block_size(class)
    }

    /// Returns the index of the first class-`class` block that starts at or
    /// after `ofs`.
    #[inline]
    pub fn index_next(&self, class: usize, ofs: usize) -> usize {
        let block_size = self.block_size(class);
        ofs / block_size + usize::from(ofs % block_size != 0)
    }

    /// Returns the offset of the class-`class` block with index `idx`.
    #[inline]
    pub fn offset(&self, class: usize, idx: usize) -> usize {
        idx * self.block_size(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_power_of_two_span() {
        let c = SizeClasses::for_span(16, 256).unwrap();
        assert_eq!(c.num_classes(), 5);
        assert_eq!(c.top_span(), 256);
        assert_eq!(c.block_size(0), 16);
        assert_eq!(c.block_count(0), 16);
        assert_eq!(c.block_size(4), 256);
        assert_eq!(c.block_count(4), 1);
    }

    #[test]
    fn irregular_span_rounds_up() {
        let c = SizeClasses::for_span(16, 300).unwrap();
        assert_eq!(c.num_classes(), 6);
        assert_eq!(c.top_span(), 512);

        // Any excess over a power of two adds a class, even less than a leaf.
        let c = SizeClasses::for_span(16, 263).unwrap();
        assert_eq!(c.top_span(), 512);

        let c = SizeClasses::for_span(16, 16).unwrap();
        assert_eq!(c.num_classes(), 1);
    }

    #[test]
    fn spans_below_one_leaf_are_rejected() {
        assert_eq!(SizeClasses::for_span(16, 0), None);
        assert_eq!(SizeClasses::for_span(16, 15), None);
        assert_eq!(SizeClasses::for_span(4096, usize::MAX), None);
    }

    #[test]
    fn class_for_rounds_up() {
        assert_eq!(SizeClasses::class_for(16, 0), Some(0));
        assert_eq!(SizeClasses::class_for(16, 1), Some(0));
        assert_eq!(SizeClasses::class_for(16, 16), Some(0));
        assert_eq!(SizeClasses::class_for(16, 17), Some(1));
        assert_eq!(SizeClasses::class_for(16, 20), Some(1));
        assert_eq!(SizeClasses::class_for(16, 200), Some(4));
        assert_eq!(SizeClasses::class_for(16, 256), Some(4));
        assert_eq!(SizeClasses::class_for(16, usize::MAX), None);
    }

    #[test]
    fn index_arithmetic() {
        let c = SizeClasses::for_span(16, 256).unwrap();

        assert_eq!(c.index(1, 64), 2);
        assert_eq!(c.index(1, 70), 2);
        assert_eq!(c.index_next(1, 64), 2);
        assert_eq!(c.index_next(1, 70), 3);
        assert_eq!(c.offset(2, 3), 192);
        assert_eq!(c.index(3, c.offset(3, 1)), 1);
    }

    #[test]
    #[should_panic(expected = "size class exceeds table")]
    fn class_past_table_panics() {
        let c = SizeClasses::for_span(16, 256).unwrap();
        c.block_size(5);
    }
}
