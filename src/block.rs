//! Memory block handles
use core::{fmt, ptr::NonNull};

use crate::{utils::checked_end, Error};

/// The state of a memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// The block is in the free list.
    Free,
    /// The block was handed out by [`Region::alloc`] and populated with the
    /// caller's data.
    ///
    /// [`Region::alloc`]: crate::Region::alloc
    Allocated,
    /// The block was handed out uninitialized by [`Region::reserve`] for
    /// zero-copy use.
    ///
    /// [`Region::reserve`]: crate::Region::reserve
    Reserved,
}

/// A handle describing a contiguous extent `[address, address + size)` of a
/// region's backing memory.
///
/// A region is constructed from a single block covering the whole window.
/// Every other block is derived from it by [`Self::fragment`] and
/// [`Self::shrink`], and merged back by [`Self::grow`]. The region exclusively
/// owns each block while it is free or outstanding, so a block never appears
/// in two collections at once.
///
/// # Safety
///
///  - `as_ptr()` must point to `size()` bytes of memory which are valid for
///    reads and writes for as long as the block (or any block derived from it)
///    exists, and which nothing but the owning region accesses.
///
///  - The memory backing address `address() + k` must be located at
///    `as_ptr() + k`. This mapping must be preserved by [`Self::grow`],
///    [`Self::shrink`], and [`Self::fragment`].
///
pub unsafe trait Block: fmt::Debug {
    /// The block's first address.
    fn address(&self) -> usize;

    /// The block's size in bytes.
    fn size(&self) -> usize;

    /// Get the host pointer to the block's first byte.
    fn as_ptr(&self) -> NonNull<u8>;

    /// Extend the block by `extra` bytes toward the end.
    ///
    /// This only updates bookkeeping. The region calls it to absorb the
    /// address-adjacent block that follows this one.
    ///
    /// # Safety
    ///
    /// `[end(), end() + extra)` must be memory of the same window that no
    /// other live block covers, e.g., a neighboring block that is dropped
    /// right after.
    unsafe fn grow(&mut self, extra: usize);

    /// Move the block's start forward by `offset` bytes and reduce its size
    /// by `amount` bytes.
    ///
    /// `shrink(n, n)` drops a leading fragment; `shrink(0, n)` drops a
    /// trailing one.
    ///
    /// # Safety
    ///
    /// `offset <= amount <= size()` must hold, so the block stays within the
    /// memory it described before the call.
    unsafe fn shrink(&mut self, offset: usize, amount: usize);

    /// Create a handle to `[address() + offset, address() + offset + len)`.
    ///
    /// # Safety
    ///
    /// The new handle aliases `self`. The caller must [`Self::shrink`] `self`
    /// so that the two no longer overlap before either is used.
    unsafe fn fragment(&self, offset: usize, len: usize) -> Self
    where
        Self: Sized;

    /// Get the one-past-end address.
    #[inline]
    fn end(&self) -> usize {
        self.address() + self.size()
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + buf.len()` exceeds [`Self::size`].
    fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(
            crate::utils::fits(offset, buf.len(), self.size()),
            "invalid read parameters"
        );
        // Safety: The range was checked above, and the memory is valid per
        //         the trait's contract. `copy` tolerates `buf` pointing into
        //         the block itself.
        unsafe {
            core::ptr::copy(
                self.as_ptr().as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            )
        };
    }

    /// Copy `buf` into the block starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + buf.len()` exceeds [`Self::size`].
    fn write(&mut self, offset: usize, buf: &[u8]) {
        assert!(
            crate::utils::fits(offset, buf.len(), self.size()),
            "invalid write parameters"
        );
        // Safety: See `read`
        unsafe {
            core::ptr::copy(
                buf.as_ptr(),
                self.as_ptr().as_ptr().add(offset),
                buf.len(),
            )
        };
    }
}

/// A [`Block`] over physical memory, addressed one-to-one.
///
/// This is what bare-metal drivers hand to hardware: the address of a block
/// is the address of its memory.
#[derive(PartialEq, Eq)]
pub struct PhysBlock {
    ptr: NonNull<u8>,
    size: usize,
}

// Safety: `PhysBlock` is a plain address range. The memory it refers to is
//         owned by the region that owns the block, which serializes access.
unsafe impl Send for PhysBlock {}

impl fmt::Debug for PhysBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysBlock({:#x}+{:#x})", self.address(), self.size)
    }
}

impl PhysBlock {
    /// Describe the memory window `[start, start + size)`.
    ///
    /// Fails with [`Error::InvalidRange`] if the window is empty, starts at
    /// address zero, or wraps around the address space.
    ///
    /// # Safety
    ///
    /// The window must be valid for reads and writes for the rest of the
    /// program, and nothing else (in particular, the global allocator or the
    /// stack) may ever use it.
    pub unsafe fn new(start: usize, size: usize) -> Result<Self, Error> {
        let ptr = NonNull::new(start as *mut u8)
            .filter(|_| size != 0 && checked_end(start, size).is_some())
            .ok_or(Error::InvalidRange { start, size })?;
        Ok(Self { ptr, size })
    }
}

unsafe impl Block for PhysBlock {
    #[inline]
    fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    unsafe fn grow(&mut self, extra: usize) {
        assert!(
            self.size
                .checked_add(extra)
                .and_then(|size| checked_end(self.address(), size))
                .is_some(),
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
        // Safety: `offset <= size`, so the result stays within (or at the end
        //         of) the window, which does not wrap around.
        self.ptr = NonNull::new_unchecked(self.ptr.as_ptr().add(offset));
        self.size -= amount;
    }

    #[inline]
    unsafe fn fragment(&self, offset: usize, len: usize) -> Self {
        debug_assert!(crate::utils::fits(offset, len, self.size));
        Self {
            ptr: NonNull::new_unchecked(self.ptr.as_ptr().add(offset)),
            size: len,
        }
    }
}
