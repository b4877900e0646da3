//! Binary-buddy allocation with self-hosted metadata.
//!
//! A buddy allocator manages a region modeled as one block of `2^(N-1)`
//! leaves. Any block larger than a leaf can be split into two equally-sized
//! halves, its _buddies_; when both halves are free again they are merged
//! back into their parent. Requests are rounded up to the nearest block size,
//! so every allocation is a power-of-two multiple of the leaf size.
//!
//! Each size class keeps a free list and an allocation bitmap. A bit is set
//! while the block it tracks is unavailable at that class: granted to a
//! caller (directly or as part of a larger grant), split on behalf of a
//! grant, or reserved. The size of an allocation is never stored; freeing a
//! block scans the bitmaps upward from the leaf class and takes the first
//! class with the block's bit set.
//!
//! The bitmaps and class table are placed at the start of the managed range
//! and permanently reserved, as is any tail of the power-of-two model that
//! lies past the end of the real range.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                 |
//! |--------------------------|-----------|----------------------------|
//! | Allocate                 | O(1)      | O(size classes)            |
//! | Deallocate               | O(size classes) | O(size classes)      |
//!
//! #### Fragmentation
//!
//! Because requests are rounded up to a power-of-two multiple of the leaf
//! size, internal fragmentation approaches half of each block in the worst
//! case. External fragmentation is bounded by coalescing: two free buddies
//! never coexist on the same free list.

use core::{
    alloc::Layout,
    cell::RefCell,
    cmp, fmt, mem,
    num::NonZeroUsize,
    ptr::NonNull,
    slice,
};

use spin::Mutex as SpinMutex;

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

#[cfg(any(feature = "alloc", test))]
use crate::Global;

use crate::{
    base::{BasePtr, BlockLink},
    bitmap::Bitmap,
    free_list::FreeList,
    size_class::SizeClasses,
    AllocError, AllocInitError, BackingAllocator, Raw,
};

/// Declares wrappers which share a `Buddy` behind an interior-mutability
/// primitive.
macro_rules! declare_wrappers {
    ($($(#[$attr:meta])* $wrapper:ident uses $typename:ident via $method:path)*) => {
        $(
            $(#[$attr])*
            pub struct $wrapper<const LEAF_SIZE: usize, const MAX_CLASSES: usize, A: BackingAllocator>
            {
                inner: $typename<Buddy<LEAF_SIZE, MAX_CLASSES, A>>,
            }

            impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize, A: BackingAllocator>
                $wrapper<LEAF_SIZE, MAX_CLASSES, A>
            {
                #[doc = concat!("Wraps `buddy` in a `", stringify!($wrapper), "`.")]
                pub fn new(buddy: Buddy<LEAF_SIZE, MAX_CLASSES, A>) -> Self {
                    $wrapper {
                        inner: $typename::new(buddy),
                    }
                }

                /// Returns a reference to the inner wrapper.
                pub fn inner(&self) -> &$typename<Buddy<LEAF_SIZE, MAX_CLASSES, A>> {
                    &self.inner
                }

                /// Consumes the wrapper, returning the allocator.
                pub fn into_inner(self) -> Buddy<LEAF_SIZE, MAX_CLASSES, A> {
                    self.inner.into_inner()
                }

                /// Attempts to allocate a block of at least `nbytes` bytes.
                ///
                /// See [`Buddy::allocate`].
                ///
                /// # Errors
                ///
                /// Returns `Err` if no free block is large enough.
                pub fn allocate(&self, nbytes: usize) -> Result<NonNull<[u8]>, AllocError> {
                    $method(&self.inner).allocate(nbytes)
                }

                /// Returns a block to the allocator.
                ///
                /// See [`Buddy::free`].
                ///
                /// # Safety
                ///
                /// `ptr` must denote a block of memory currently allocated via
                /// this allocator.
                pub unsafe fn free(&self, ptr: NonNull<u8>) {
                    unsafe { $method(&self.inner).free(ptr) }
                }

                /// Returns the size of the block granted for a request of
                /// `nbytes` bytes. This does not take the lock.
                ///
                /// See [`Buddy::rounded_size`].
                pub fn rounded_size(&self, nbytes: usize) -> usize {
                    Buddy::<LEAF_SIZE, MAX_CLASSES, A>::rounded_size(nbytes)
                }

                /// Returns a snapshot of the allocator's usage.
                pub fn stats(&self) -> Stats {
                    $method(&self.inner).stats()
                }
            }

            impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize, A: BackingAllocator>
                From<Buddy<LEAF_SIZE, MAX_CLASSES, A>> for $wrapper<LEAF_SIZE, MAX_CLASSES, A>
            {
                fn from(buddy: Buddy<LEAF_SIZE, MAX_CLASSES, A>) -> Self {
                    $wrapper::new(buddy)
                }
            }

            impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize, A: BackingAllocator> fmt::Debug
                for $wrapper<LEAF_SIZE, MAX_CLASSES, A>
            {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.debug_struct(stringify!($wrapper)).finish_non_exhaustive()
                }
            }
        )*
    };
}

declare_wrappers! {
    /// A `Buddy` behind a spin lock.
    ///
    /// Every operation holds the lock for its full duration, so splitting and
    /// coalescing across size classes is atomic with respect to other
    /// callers. Waiting callers busy-wait; nothing ever blocks on memory
    /// becoming available.
    SpinBuddy uses SpinMutex via SpinMutex::lock

    /// A `Buddy` behind a `RefCell`, for single-threaded contexts.
    ///
    /// # Panics
    ///
    /// Each operation panics if called while another operation on the same
    /// allocator is in progress.
    RefCellBuddy uses RefCell via RefCell::borrow_mut
}

/// The free list and allocation bitmap of one size class.
///
/// Values of this type live in the class table at the start of the managed
/// region.
struct SizeClass {
    free: FreeList,
    alloc: Bitmap,
}

/// A binary-buddy allocator.
///
/// This takes two const parameters:
/// - `LEAF_SIZE` is the size of the smallest block the allocator grants.
/// - `MAX_CLASSES` is the maximum number of size classes the allocator may
///   use; construction fails if the managed range needs more.
///
/// These parameters are subject to the following invariants:
/// - `LEAF_SIZE` must be a power of two, and at least
///   `2 * mem::size_of::<usize>()` so that a free block can hold its list
///   links.
/// - `MAX_CLASSES` must be nonzero and less than `usize::BITS`.
///
/// Attempting to construct a `Buddy` whose const parameters violate these
/// invariants will result in a panic.
///
/// For example, the type of a buddy allocator managing 4 KiB pages over at
/// most 1 GiB of memory would be:
///
/// ```
/// use kbuddy::{Buddy, Raw};
///
/// // 4096 << (19 - 1) == 1 GiB
/// type PageAllocator = Buddy<4096, 19, Raw>;
/// # fn main() {}
/// ```
pub struct Buddy<const LEAF_SIZE: usize, const MAX_CLASSES: usize, A: BackingAllocator> {
    raw: RawBuddy<LEAF_SIZE, MAX_CLASSES>,
    backing_allocator: A,
}

// SAFETY: `Buddy` exclusively owns its region, including the metadata that
// the raw pointers inside `RawBuddy` refer to.
unsafe impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize, A> Send
    for Buddy<LEAF_SIZE, MAX_CLASSES, A>
where
    A: BackingAllocator + Send,
{
}

impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize> Buddy<LEAF_SIZE, MAX_CLASSES, Raw> {
    /// Constructs a new `Buddy` managing the memory in `[region, end)`.
    ///
    /// The start of the range is rounded up to a multiple of `LEAF_SIZE`. The
    /// allocator places its metadata at the start of the range; everything
    /// after it is available for allocation.
    ///
    /// For a discussion of buddy allocation, see the [module-level
    /// documentation].
    ///
    /// # Errors
    ///
    /// Returns an error if any of the following are true:
    /// - `end` is below the address of `region`, or the power-of-two span
    ///   covering the range would overflow the address space.
    /// - The range cannot hold one leaf plus the allocator metadata.
    /// - Covering the range needs more than `MAX_CLASSES` size classes.
    ///
    /// # Panics
    ///
    /// Panics if the const parameters are invalid, or if the initialized free
    /// lists do not account for exactly the free part of the range.
    ///
    /// # Safety
    ///
    /// The memory in `[region, end)` must be valid for reads and writes, and
    /// must not be accessed except through the returned allocator for as long
    /// as it exists.
    ///
    /// [module-level documentation]: crate::buddy
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        end: NonZeroUsize,
    ) -> Result<Buddy<LEAF_SIZE, MAX_CLASSES, Raw>, AllocInitError> {
        unsafe { RawBuddy::try_new(region, end).map(|b| b.with_backing_allocator(Raw)) }
    }
}

#[cfg(any(feature = "alloc", test))]
impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize> Buddy<LEAF_SIZE, MAX_CLASSES, Global> {
    /// Attempts to construct a new `Buddy` backed by the global allocator.
    ///
    /// The managed range of `span` bytes is allocated from the global
    /// allocator according to the layout indicated by
    /// [`Self::region_layout(span)`], and released when the `Buddy` is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if sufficient memory could not be allocated from the
    /// global allocator, or if `span` is unusable for the reasons listed in
    /// [`Buddy::new_raw`].
    ///
    /// [`Self::region_layout(span)`]: Buddy::region_layout
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(span: usize) -> Result<Buddy<LEAF_SIZE, MAX_CLASSES, Global>, AllocInitError> {
        let region_layout = Self::region_layout(span)?;

        if region_layout.size() == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        unsafe {
            // SAFETY: region size is not zero
            let region_raw = alloc::alloc::alloc(region_layout);
            let region = NonNull::new(region_raw).ok_or(AllocInitError::AllocFailed(region_layout))?;

            let end = region
                .addr()
                .checked_add(span)
                .ok_or(AllocInitError::InvalidLocation);

            match end.and_then(|end| RawBuddy::try_new(region, end)) {
                Ok(raw) => Ok(raw.with_backing_allocator(Global)),
                Err(e) => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    Err(e)
                }
            }
        }
    }
}

impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize, A: BackingAllocator>
    Buddy<LEAF_SIZE, MAX_CLASSES, A>
{
    /// Returns the layout requirements of a region of `span` bytes managed by
    /// an allocator of this type.
    ///
    /// # Errors
    ///
    /// Returns an error if `span` overflows an `isize` when rounded up to a
    /// multiple of `LEAF_SIZE`.
    pub fn region_layout(span: usize) -> Result<Layout, AllocInitError> {
        Layout::from_size_align(span, LEAF_SIZE).map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Returns the size of the block granted for a request of `nbytes` bytes.
    ///
    /// This is `nbytes` rounded up to the next power-of-two multiple of
    /// `LEAF_SIZE`. It does not depend on the state of any allocator, and it
    /// is returned even when no allocator of this type could grant a block
    /// that large.
    ///
    /// # Panics
    ///
    /// Panics if no power of two is at least `nbytes`.
    pub fn rounded_size(nbytes: usize) -> usize {
        let class = SizeClasses::class_for(LEAF_SIZE, nbytes)
            .unwrap_or_else(|| panic!("request of {} bytes has no size class", nbytes));

        LEAF_SIZE << class
    }

    /// Returns the number of size classes in use.
    pub fn num_classes(&self) -> usize {
        self.raw.classes.num_classes()
    }

    /// Attempts to allocate a block of at least `nbytes` bytes.
    ///
    /// On success, returns a [`NonNull<[u8]>`] covering the whole granted
    /// block, whose length is [`Self::rounded_size(nbytes)`]. A request of
    /// zero bytes is granted one leaf.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no free block is large enough. The allocator is left
    /// unchanged, and smaller requests may still succeed.
    ///
    /// [`NonNull<[u8]>`]: NonNull
    /// [`Self::rounded_size(nbytes)`]: Buddy::rounded_size
    pub fn allocate(&mut self, nbytes: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.raw.allocate(nbytes)
    }

    /// Returns a block to the allocator, merging it with its buddy as long
    /// as the buddy is free.
    ///
    /// The size of the block is recovered from the allocation bitmaps; it is
    /// never stored.
    ///
    /// # Panics
    ///
    /// Panics if the block recovered from the bitmaps is misaligned for its
    /// size class, or overlaps the metadata or the reserved tail. This
    /// catches frees of pointers into the metadata, misaligned pointers, and
    /// double frees whose first free merged up to reserved memory, but not
    /// all invalid frees.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this
    /// allocator. Freeing a block twice, or freeing a pointer this allocator
    /// did not return, corrupts the allocator.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe { self.raw.free(ptr) }
    }

    /// Returns a snapshot of the allocator's usage.
    ///
    /// This walks every free list.
    pub fn stats(&self) -> Stats {
        self.raw.stats()
    }

    /// Returns a value whose `Display` implementation describes every size
    /// class: its free list and the ranges of set allocation bits.
    ///
    /// The format is meant for debugging and is not stable.
    pub fn dump(&self) -> Dump<'_> {
        Dump {
            base: self.raw.base,
            classes: self.raw.classes,
            table: self.raw.table(),
        }
    }
}

impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize, A: BackingAllocator> fmt::Debug
    for Buddy<LEAF_SIZE, MAX_CLASSES, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buddy")
            .field("base", &self.raw.base.addr())
            .field("num_classes", &self.raw.classes.num_classes())
            .field("meta_end", &self.raw.meta_end)
            .field("unavailable", &self.raw.unavailable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize, A: BackingAllocator>
    Buddy<LEAF_SIZE, MAX_CLASSES, A>
{
    /// Offset of `block` from the start of the modeled region.
    pub(crate) fn offset_of(&self, block: NonNull<u8>) -> usize {
        self.raw.base.offset_to(block.addr())
    }

    /// Size of the largest block on any free list, or zero.
    pub(crate) fn largest_free_block(&self) -> usize {
        let classes = self.raw.classes;

        self.raw
            .table()
            .iter()
            .enumerate()
            .rev()
            .find(|(_, sc)| !sc.free.is_empty())
            .map_or(0, |(class, _)| classes.block_size(class))
    }
}

impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize, A: BackingAllocator> Drop
    for Buddy<LEAF_SIZE, MAX_CLASSES, A>
{
    fn drop(&mut self) {
        // For `Raw` regions deallocation is a no-op, so a range that has no
        // valid layout does not matter.
        if let Ok(region_layout) = Self::region_layout(self.raw.region_size) {
            unsafe {
                self.backing_allocator
                    .deallocate(self.raw.region, region_layout)
            };
        }
    }
}

/// The allocator state, without a backing allocator.
struct RawBuddy<const LEAF_SIZE: usize, const MAX_CLASSES: usize> {
    base: BasePtr,
    /// The range passed at construction, before rounding.
    region: NonNull<u8>,
    region_size: usize,
    classes: SizeClasses,
    /// The class table, at the start of the region.
    table: NonNull<SizeClass>,
    /// Offset of the first byte past the metadata, rounded up to a leaf.
    meta_end: usize,
    /// Size of the reserved tail past the end of the real range.
    unavailable: usize,
}

impl<const LEAF_SIZE: usize, const MAX_CLASSES: usize> RawBuddy<LEAF_SIZE, MAX_CLASSES> {
    fn assert_const_param_invariants() {
        assert!(
            LEAF_SIZE.is_power_of_two(),
            "buddy allocator leaf size must be a power of two"
        );
        assert!(
            LEAF_SIZE >= mem::size_of::<BlockLink>(),
            "buddy allocator leaf size must be at least mem::size_of::<BlockLink>() bytes"
        );
        assert!(
            MAX_CLASSES > 0,
            "buddy allocator must have at least one size class"
        );
        assert!(
            MAX_CLASSES < usize::BITS as usize,
            "buddy allocator cannot have more size classes than bits in a usize"
        );
    }

    /// Returns the layout of the metadata: the class table followed by the
    /// bitmap of every class.
    fn metadata_layout(classes: &SizeClasses) -> Layout {
        let table = Layout::array::<SizeClass>(classes.num_classes()).unwrap();

        (0..classes.num_classes()).fold(table, |layout, class| {
            layout
                .extend(Bitmap::map_layout(classes.block_count(class)))
                .unwrap()
                .0
        })
    }

    /// Attempts to construct an allocator over `[region, end)`.
    ///
    /// # Safety
    ///
    /// The memory in `[region, end)` must be valid for reads and writes, and
    /// must not be accessed except through the returned value.
    unsafe fn try_new(region: NonNull<u8>, end: NonZeroUsize) -> Result<Self, AllocInitError> {
        Self::assert_const_param_invariants();

        let region_size = end
            .get()
            .checked_sub(region.addr().get())
            .ok_or(AllocInitError::InvalidLocation)?;

        let base_addr = align_up(region.addr().get(), LEAF_SIZE)
            .and_then(NonZeroUsize::new)
            .ok_or(AllocInitError::InvalidLocation)?;
        let span = end.get().saturating_sub(base_addr.get());

        let classes = SizeClasses::for_span(LEAF_SIZE, span).ok_or(AllocInitError::InvalidConfig)?;
        if classes.num_classes() > MAX_CLASSES {
            return Err(AllocInitError::InvalidConfig);
        }

        // The model covers the whole top block, even past `end`.
        let top_span = classes.top_span();
        base_addr
            .get()
            .checked_add(top_span)
            .ok_or(AllocInitError::InvalidLocation)?;

        // Lay out the metadata before writing anything.
        let meta_layout = Self::metadata_layout(&classes);
        let meta_end = align_up(meta_layout.size(), LEAF_SIZE).ok_or(AllocInitError::InvalidConfig)?;
        if meta_end > span {
            return Err(AllocInitError::InvalidConfig);
        }

        let unavailable = align_up(top_span - span, LEAF_SIZE).unwrap();

        log::debug!(
            "buddy: memory size is {} bytes; {} size classes of {}..={} bytes",
            span,
            classes.num_classes(),
            LEAF_SIZE,
            top_span
        );

        let base = BasePtr::new(region.with_addr(base_addr), top_span);
        let table = base.ptr().cast::<SizeClass>();

        // Zero the class table, then emplace each class with its bitmap.
        unsafe { table.as_ptr().write_bytes(0, classes.num_classes()) };

        let mut cursor = Layout::array::<SizeClass>(classes.num_classes()).unwrap();
        for class in 0..classes.num_classes() {
            let num_bits = classes.block_count(class);
            let (extended, bitmap_ofs) = cursor.extend(Bitmap::map_layout(num_bits)).unwrap();
            cursor = extended;

            // SAFETY: the bitmap lies within the metadata, which lies within
            // the region, and no other bitmap overlaps it.
            let alloc = unsafe { Bitmap::new(num_bits, base.with_offset(bitmap_ofs).as_ptr()) };

            unsafe {
                table.as_ptr().add(class).write(SizeClass {
                    free: FreeList::new(),
                    alloc,
                })
            };
        }
        debug_assert_eq!(cursor, meta_layout);

        let mut raw = RawBuddy {
            base,
            region,
            region_size,
            classes,
            table,
            meta_end,
            unavailable,
        };

        log::debug!(
            "buddy: {} meta bytes for managing {} bytes of memory",
            meta_end,
            top_span
        );
        raw.mark(0, meta_end);

        if unavailable > 0 {
            log::debug!("buddy: {:#x} bytes unavailable", unavailable);
            raw.mark(raw.tail_start(), top_span);
        }

        let free = raw.init_free();
        let expected = top_span - meta_end - unavailable;
        if free != expected {
            panic!(
                "buddy: initialized free lists hold {} bytes, expected {} (meta {}, unavailable {})",
                free, expected, meta_end, unavailable
            );
        }

        log::info!(
            "buddy: managing {:#x}..{:#x}, {} bytes free",
            base_addr,
            end,
            free
        );

        Ok(raw)
    }

    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> Buddy<LEAF_SIZE, MAX_CLASSES, A> {
        Buddy {
            raw: self,
            backing_allocator,
        }
    }

    /// Offset of the reserved tail.
    #[inline]
    fn tail_start(&self) -> usize {
        self.classes.top_span() - self.unavailable
    }

    fn table(&self) -> &[SizeClass] {
        // SAFETY: the table holds `num_classes` initialized entries, reachable
        // only through `self`.
        unsafe { slice::from_raw_parts(self.table.as_ptr(), self.classes.num_classes()) }
    }

    fn table_mut(&mut self) -> &mut [SizeClass] {
        // SAFETY: as in `table`, and `self` is borrowed mutably.
        unsafe { slice::from_raw_parts_mut(self.table.as_ptr(), self.classes.num_classes()) }
    }

    #[inline]
    fn class(&self, class: usize) -> &SizeClass {
        assert!(class < self.classes.num_classes(), "size class exceeds table");
        &self.table()[class]
    }

    #[inline]
    fn class_mut(&mut self, class: usize) -> &mut SizeClass {
        assert!(class < self.classes.num_classes(), "size class exceeds table");
        &mut self.table_mut()[class]
    }

    /// Pushes a free block onto the free list of `class`.
    ///
    /// # Safety
    ///
    /// `block` must be a free block of `class` in this allocator's region.
    unsafe fn push(&mut self, class: usize, block: NonZeroUsize) {
        let base = self.base;
        unsafe { self.class_mut(class).free.push(base, block) };
    }

    /// Marks the blocks overlapping `[start, stop)` as allocated at every
    /// size class.
    fn mark(&mut self, start: usize, stop: usize) {
        if start % LEAF_SIZE != 0 || stop % LEAF_SIZE != 0 {
            panic!("buddy: misaligned mark range {:#x}..{:#x}", start, stop);
        }

        let classes = self.classes;
        for class in 0..classes.num_classes() {
            let first = classes.index(class, start);
            let last = classes.index_next(class, stop);

            let alloc = &mut self.class_mut(class).alloc;
            for bi in first..last {
                alloc.set(bi, true);
            }
        }
    }

    /// Builds the free lists after the reserved ranges are marked.
    ///
    /// At every class below the top, only the pair of blocks at the end of
    /// the metadata and the pair at the start of the reserved tail can have
    /// exactly one free member. All other free memory is represented by a
    /// block at a larger class. Returns the number of bytes made free.
    fn init_free(&mut self) -> usize {
        let classes = self.classes;
        let tail_start = self.tail_start();

        let mut free = 0;
        for class in 0..classes.top() {
            let left = classes.index_next(class, self.meta_end);
            let right = classes.index(class, tail_start);

            free += self.init_free_pair(class, left);

            // Don't visit the same pair twice.
            if right > left && right / 2 != left / 2 {
                free += self.init_free_pair(class, right);
            }
        }

        free
    }

    /// If exactly one block of the pair containing `bi` is free, pushes it
    /// onto the free list of `class` and returns its size.
    fn init_free_pair(&mut self, class: usize, bi: usize) -> usize {
        if bi >= self.classes.block_count(class) {
            return 0;
        }

        let buddy = bi ^ 1;
        let alloc = &self.class(class).alloc;
        let (bi_set, buddy_set) = (alloc.get(bi), alloc.get(buddy));

        if bi_set == buddy_set {
            return 0;
        }

        let free_bi = if bi_set { buddy } else { bi };
        let block = self.base.addr_at(self.classes.offset(class, free_bi));

        // SAFETY: the bit for `free_bi` is clear, so the block lies outside
        // the metadata and the reserved tail.
        unsafe { self.push(class, block) };

        self.classes.block_size(class)
    }

    fn allocate(&mut self, nbytes: usize) -> Result<NonNull<[u8]>, AllocError> {
        let classes = self.classes;
        let base = self.base;

        let target = SizeClasses::class_for(LEAF_SIZE, nbytes)
            .filter(|&class| class < classes.num_classes())
            .ok_or(AllocError)?;

        // Take a block from the smallest class that has one.
        let found = (target..classes.num_classes())
            .find(|&class| !self.class(class).free.is_empty())
            .ok_or(AllocError)?;
        let block = unsafe { self.class_mut(found).free.pop(base) }.ok_or(AllocError)?;

        let ofs = base.offset_to(block);
        self.class_mut(found).alloc.set(classes.index(found, ofs), true);

        // Split the block repeatedly. The lower half is kept and the upper
        // half goes on the free list one class down.
        for class in (target..found).rev() {
            self.class_mut(class).alloc.set(classes.index(class, ofs), true);

            let upper = base.addr_at(ofs + classes.block_size(class));
            unsafe { self.push(class, upper) };
        }

        if found > target {
            log::trace!(
                "buddy: split class {} block at {:#x} down to class {}",
                found,
                block,
                target
            );
        }

        // The returned block inherits the provenance of the base pointer.
        Ok(base.with_addr_and_size(block, classes.block_size(target)))
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let classes = self.classes;
        let base = self.base;

        // Immediately drop the pointer by converting it to an address. Any
        // further access to the block goes through the base pointer.
        let block = ptr.addr();
        debug_assert!(base.contains_addr(block), "freed block outside region");

        let mut ofs = base.offset_to(block);

        // The block was granted at the first class whose bit is set. The top
        // block always overlaps the metadata, so the scan never comes up empty.
        let mut class = (0..classes.num_classes())
            .find(|&class| self.class(class).alloc.get(classes.index(class, ofs)))
            .unwrap_or(classes.top());

        // A granted block is aligned to its class and lies between the
        // metadata and the reserved tail.
        let size = classes.block_size(class);
        if ofs % size != 0 || ofs < self.meta_end || ofs + size > self.tail_start() {
            panic!(
                "buddy: block at {:#x} is not allocated (class {} resolves to {:#x}..{:#x})",
                block,
                class,
                ofs,
                ofs + size
            );
        }

        loop {
            let bi = classes.index(class, ofs);
            let level = self.class_mut(class);
            level.alloc.set(bi, false);

            if class == classes.top() {
                break;
            }

            let buddy = bi ^ 1;
            if level.alloc.get(buddy) {
                break;
            }

            // The buddy is free; take it off its list and merge.
            let buddy_ofs = classes.offset(class, buddy);
            unsafe { level.free.remove(base, base.addr_at(buddy_ofs)) };

            ofs = cmp::min(ofs, buddy_ofs);
            class += 1;

            log::trace!(
                "buddy: merged block at {:#x} into class {}",
                base.addr_at(ofs),
                class
            );
        }

        unsafe { self.push(class, base.addr_at(ofs)) };
    }

    fn free_bytes(&self) -> usize {
        self.table()
            .iter()
            .enumerate()
            .map(|(class, sc)| {
                let count = unsafe { sc.free.iter(self.base) }.count();
                count * self.classes.block_size(class)
            })
            .sum()
    }

    fn stats(&self) -> Stats {
        let total = self.classes.top_span();
        let free = self.free_bytes();

        Stats {
            total,
            metadata: self.meta_end,
            unavailable: self.unavailable,
            free,
            allocated: total - self.meta_end - self.unavailable - free,
        }
    }
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
#[inline]
fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());

    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// A snapshot of a buddy allocator's usage, in bytes.
///
/// `total` always equals the sum of the other four fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stats {
    /// The size of the power-of-two region modeled by the allocator.
    pub total: usize,
    /// Bytes reserved for the allocator's own metadata.
    pub metadata: usize,
    /// Bytes of the modeled region that lie past the end of the real range.
    pub unavailable: usize,
    /// Bytes on the free lists.
    pub free: usize,
    /// Bytes currently granted to callers.
    pub allocated: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Buddy Allocator")?;
        writeln!(f, "~~~~~~~~~~~~~~~")?;
        writeln!(f, "Total:       {:#x}", self.total)?;
        writeln!(f, "Metadata:    {:#x}", self.metadata)?;
        writeln!(f, "Unavailable: {:#x}", self.unavailable)?;
        writeln!(f, "Allocated:   {:#x}", self.allocated)?;
        writeln!(f, "Free:        {:#x}", self.free)
    }
}

/// A per-class description of a buddy allocator's state.
///
/// Returned by [`Buddy::dump`].
pub struct Dump<'a> {
    base: BasePtr,
    classes: SizeClasses,
    table: &'a [SizeClass],
}

impl fmt::Display for Dump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (class, sc) in self.table.iter().enumerate() {
            write!(
                f,
                "size {} (blksz {} nblk {}): free list:",
                class,
                self.classes.block_size(class),
                self.classes.block_count(class)
            )?;

            for block in unsafe { sc.free.iter(self.base) } {
                write!(f, " {:#x}", self.base.offset_to(block))?;
            }

            write!(f, "\n  alloc:")?;
            for range in sc.alloc.ranges() {
                write!(f, " [{}, {})", range.start, range.end)?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Dump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dump")
            .field("num_classes", &self.classes.num_classes())
            .finish_non_exhaustive()
    }
}
