//! A small library for ~~hating on~~ evaluating the correctness of
//! size-class allocators.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

/// Largest request generated, expressed in bits.
const SIZE_LIMIT_BITS: u32 = 20;

/// A request size which implements `Arbitrary`.
///
/// Sizes are spread over orders of magnitude rather than uniformly, so that
/// both leaf-sized and multi-class requests are common.
#[derive(Clone, Copy, Debug)]
pub struct ArbSize(pub usize);

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let bits = u32::from(u8::arbitrary(u)?) % (SIZE_LIMIT_BITS + 1);
        let size = usize::arbitrary(u)? % (1_usize << bits).max(1);

        Ok(ArbSize(size))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    Alloc(usize),
    Dealloc(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbSize::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

/// An allocator under evaluation.
pub trait Subject {
    type AllocError;

    /// Allocates a block of at least `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Returns the block pointed to by `ptr` to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>);

    /// Checks allocator-wide invariants once every block has been returned.
    fn check_quiescent(&self) -> bool {
        true
    }
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the granted region, which may exceed the request.
    ptr: NonNull<[u8]>,
    // The requested size.
    size: usize,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

unsafe fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the returned `Block` until
    ///   said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, size: usize, id: u64) -> Block {
        let mut b = Block { ptr, size, id };
        b.paint(id);
        b
    }

    /// Returns the requested size of the block.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the `Block`'s memory as a slice of uninitialized bytes.
    pub fn as_uninit_slice(&self) -> &[MaybeUninit<u8>] {
        // SAFETY: self is immutably borrowed, so only immutable references to
        // the slice can exist
        unsafe { &*slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    pub fn into_raw_parts(self) -> (NonNull<[u8]>, usize) {
        (self.ptr, self.size)
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        unsafe { paint(self.as_uninit_slice_mut(), id) };
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: Option<AllocatorOp>,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;
            match op {
                AllocatorOp::Alloc(size) => {
                    let ptr = match self.subject.allocate(size) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    if ptr.len() < size {
                        return Err(Failed {
                            completed,
                            failed_op: Some(op),
                        });
                    }

                    let block = unsafe { Block::init(ptr, size, op_id) };
                    blocks.push(block);
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    let mut block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => continue,
                    };

                    if !block.verify() {
                        return Err(Failed {
                            completed,
                            failed_op: Some(op),
                        });
                    }

                    unsafe {
                        block.paint(op_id);
                        self.subject.deallocate(block.ptr.cast());
                    }
                }
            }

            completed.push(op);
        }

        for block in blocks {
            if !block.verify() {
                return Err(Failed {
                    completed,
                    failed_op: None,
                });
            }

            unsafe { self.subject.deallocate(block.ptr.cast()) };
        }

        if !self.subject.check_quiescent() {
            return Err(Failed {
                completed,
                failed_op: None,
            });
        }

        Ok(())
    }
}
