//! Heap-backed blocks
use alloc::{
    alloc::{alloc_zeroed, dealloc, handle_alloc_error},
    sync::Arc,
};
use core::{alloc::Layout, fmt, ptr::NonNull};

use crate::{utils::checked_end, Block, Error};

/// The alignment of the host allocation behind a [`HeapBlock`] window.
const HEAP_ALIGN: usize = 64;

/// A zero-initialized host allocation presented at a chosen address.
struct HeapMemory {
    ptr: NonNull<u8>,
    layout: Layout,
    /// The address the first byte of `ptr` is presented at.
    start: usize,
}

// Safety: `HeapMemory` owns its allocation. Access to the bytes goes through
//         blocks owned by a single region, which serializes it.
unsafe impl Send for HeapMemory {}
unsafe impl Sync for HeapMemory {}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        // Safety: `ptr` was allocated with `layout`
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A [`Block`] backed by a host heap allocation.
///
/// The window can be placed at any address (e.g., a device's view of the
/// memory), which decouples addresses from host pointers. This is useful for
/// running and testing drivers on a hosted target. The allocation is freed
/// when the last block derived from it is dropped.
pub struct HeapBlock {
    memory: Arc<HeapMemory>,
    address: usize,
    size: usize,
}

impl fmt::Debug for HeapBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapBlock({:#x}+{:#x})", self.address, self.size)
    }
}

impl HeapBlock {
    /// Allocate a `size`-byte window presented at `[start, start + size)`.
    ///
    /// Fails with [`Error::InvalidRange`] if the window is empty or wraps
    /// around the address space.
    pub fn new(start: usize, size: usize) -> Result<Self, Error> {
        let layout = Some(size)
            .filter(|&size| size != 0 && checked_end(start, size).is_some())
            .and_then(|size| Layout::from_size_align(size, HEAP_ALIGN).ok())
            .ok_or(Error::InvalidRange { start, size })?;

        // Safety: `layout` is not zero-sized
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .unwrap_or_else(|| handle_alloc_error(layout));

        Ok(Self {
            memory: Arc::new(HeapMemory { ptr, layout, start }),
            address: start,
            size,
        })
    }
}

unsafe impl Block for HeapBlock {
    #[inline]
    fn address(&self) -> usize {
        self.address
    }

    #[inline]
    fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn as_ptr(&self) -> NonNull<u8> {
        let offset = self.address - self.memory.start;
        debug_assert!(offset < self.memory.layout.size());
        // Safety: A live block is non-empty and lies within the allocation,
        //         so `offset` is in bounds.
        unsafe { NonNull::new_unchecked(self.memory.ptr.as_ptr().add(offset)) }
    }

    #[inline]
    unsafe fn grow(&mut self, extra: usize) {
        let window = self.memory.layout.size();
        assert!(
            extra <= window - (self.address - self.memory.start) - self.size,
            "invalid grow parameters"
        );
        self.size += extra;
    }

    #[inline]
    unsafe fn shrink(&mut self, offset: usize, amount: usize) {
        assert!(
            offset <= amount && amount <= self.size,
            "invalid shrink parameters"
        );
        self.address += offset;
        self.size -= amount;
    }

    #[inline]
    unsafe fn fragment(&self, offset: usize, len: usize) -> Self {
        debug_assert!(crate::utils::fits(offset, len, self.size));
        Self {
            memory: Arc::clone(&self.memory),
            address: self.address + offset,
            size: len,
        }
    }
}
