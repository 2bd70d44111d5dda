//! The region allocator core
use alloc::{
    collections::{btree_map, BTreeMap},
    vec::Vec,
};
use core::{fmt, mem, ptr::NonNull};

use crate::{
    block::{Block, BlockKind, PhysBlock},
    lock::Lock,
    utils::align_padding,
    Error, Init,
};

/// The alignment applied when a caller passes `align == 0`: one machine word.
pub const DEFAULT_ALIGN: usize = mem::size_of::<usize>();

#[doc = svgbobdoc::transform!(
/// A fixed address window from which DMA buffers are allocated.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///  start()                                                            end()
///    ,----------+--------------+-----+---------------+------------------,
///    |   free   |   reserved   | pad |   allocated   |       free       |
///    '----+-----+------+-------+--+--+-------+-------+---------+--------'
///         |            |          |          |                 |
///         v            |          v          |                 v
///  free: [0] ----------|-------> [1] --------|---------------> [2]
///                      v                     v
///  used:        { address: Reserved,  address: Allocated }
/// ```
/// </center>
///
///  - `free` is a list of free blocks sorted by address. No two of them are
///    address-adjacent: a released block is merged with its neighbors right
///    away.
///
///  - `used` maps the address of every outstanding buffer to its block.
///
///  - Together, they cover `start()..end()` exactly once.
///
/// # Allocation
///
/// Allocation is first-fit: the free list is searched in address order for
/// the first block that can hold the request after padding its start to the
/// requested alignment. The padding and any remainder are split off and stay
/// in the free list.
///
/// # Locking
///
/// Every operation holds one lock for its whole duration. Operations never
/// call back into user code other than the [`Block`] implementation, which
/// must not call into the region.
)]
pub struct Region<B> {
    inner: Lock<Inner<B>>,
}

struct Inner<B> {
    start: usize,
    size: usize,
    /// The host address of `start`.
    base: usize,
    free: Vec<B>,
    used: BTreeMap<usize, Used<B>>,
}

/// An outstanding block.
struct Used<B> {
    kind: BlockKind,
    block: B,
}

/// A snapshot of a block's extent and state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub address: usize,
    pub size: usize,
    pub kind: BlockKind,
}

impl Extent {
    fn of(block: &impl Block, kind: BlockKind) -> Self {
        Self {
            address: block.address(),
            size: block.size(),
            kind,
        }
    }

    /// Get the one-past-end address.
    #[inline]
    pub fn end(&self) -> usize {
        self.address + self.size
    }
}

impl<B> Init for Region<B> {
    /// An empty region. Every allocation fails until [`Region::init`] is
    /// called.
    const INIT: Self = Self {
        inner: Lock::new(Inner {
            start: 0,
            size: 0,
            base: 0,
            free: Vec::new(),
            used: BTreeMap::new(),
        }),
    };
}

impl<B> Default for Region<B> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<B: Block> fmt::Debug for Region<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        let used: Vec<_> = inner.used.values().map(|used| &used.block).collect();
        let result = f
            .debug_struct("Region")
            .field("start", &format_args!("{:#x}", inner.start))
            .field("size", &format_args!("{:#x}", inner.size))
            .field("free", &inner.free)
            .field("used", &used)
            .finish();
        result
    }
}

impl Region<PhysBlock> {
    /// Construct a region over the physical memory window
    /// `[start, start + size)`.
    ///
    /// # Safety
    ///
    /// See [`PhysBlock::new`].
    pub unsafe fn from_raw_parts(start: usize, size: usize) -> Result<Self, Error> {
        Ok(Self::new(PhysBlock::new(start, size)?))
    }
}

impl<B: Block> Region<B> {
    /// Construct a region managing the window described by `block`.
    pub fn new(block: B) -> Self {
        let this = Self::INIT;
        this.init(block);
        this
    }

    /// Reinitialize the region to manage the window described by `block`.
    ///
    /// Outstanding buffers are discarded; using their addresses afterwards
    /// is the caller's responsibility to avoid.
    pub fn init(&self, block: B) {
        let mut inner = self.inner.lock();
        log::trace!("init {:?}", block);
        inner.start = block.address();
        inner.size = block.size();
        inner.base = block.as_ptr().as_ptr() as usize;
        inner.used.clear();
        inner.free.clear();
        inner.free.push(block);
    }

    /// Return every outstanding buffer to the free list, leaving a single
    /// free block covering the whole window.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        for (_, used) in mem::take(&mut inner.used) {
            inner.insert_free(used.block);
        }
        debug_assert!(inner.free.len() <= 1);
    }

    /// Get the region's first address.
    pub fn start(&self) -> usize {
        self.inner.lock().start
    }

    /// Get the region's one-past-end address.
    pub fn end(&self) -> usize {
        let inner = self.inner.lock();
        inner.start + inner.size
    }

    /// Get the region's size in bytes.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Reserve an uninitialized buffer of `size` bytes, aligned to `align`
    /// bytes ([`DEFAULT_ALIGN`] if `align == 0`).
    ///
    /// Returns the buffer's address and a pointer to its memory. The buffer
    /// must be returned by [`Self::release`].
    ///
    /// Reserving buffers lets drivers fill hardware-visible memory in place.
    /// Passing a reserved buffer (or a subslice of it) to [`Self::alloc`]
    /// returns its address without allocating or copying, and passing it to
    /// [`Self::read`] returns without copying.
    ///
    /// # Errors
    ///
    ///  - [`Error::ZeroSize`] if `size == 0`.
    ///  - [`Error::InvalidAlignment`] if `align` is not zero or a power of two.
    ///  - [`Error::OutOfMemory`] if no free block can hold the buffer.
    ///
    pub fn reserve(&self, size: usize, align: usize) -> Result<(usize, NonNull<[u8]>), Error> {
        let mut inner = self.inner.lock();
        let block = inner.allocate(size, align, BlockKind::Reserved)?;
        Ok((
            block.address(),
            NonNull::slice_from_raw_parts(block.as_ptr(), size),
        ))
    }

    /// Check whether `buf` lies within the region's memory.
    ///
    /// Returns the address of `buf`'s first byte if it does. This tells
    /// whether a caller-supplied buffer is already visible to hardware, e.g.,
    /// because it was obtained from [`Self::reserve`].
    pub fn reserved(&self, buf: &[u8]) -> Option<usize> {
        self.inner.lock().translate(buf)
    }

    /// Allocate a buffer holding a copy of `data`, aligned to `align` bytes
    /// ([`DEFAULT_ALIGN`] if `align == 0`).
    ///
    /// Returns the buffer's address. The buffer must be returned by
    /// [`Self::free`].
    ///
    /// If `data` already lies within the region (see [`Self::reserved`]), its
    /// address is returned as is. Nothing is allocated in this case, and the
    /// buffer must not be passed to [`Self::free`].
    ///
    /// # Errors
    ///
    /// See [`Self::reserve`].
    pub fn alloc(&self, data: &[u8], align: usize) -> Result<usize, Error> {
        let mut inner = self.inner.lock();

        if let Some(address) = inner.translate(data) {
            log::trace!("alloc: {:#x} is already in the region", address);
            return Ok(address);
        }

        let block = inner.allocate(data.len(), align, BlockKind::Allocated)?;
        block.write(0, data);
        Ok(block.address())
    }

    /// Copy `buf.len()` bytes starting at `offset` of the buffer at `addr`
    /// into `buf`.
    ///
    /// If `buf` itself lies within the region, it's assumed to be the
    /// (already current) buffer and is left untouched.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not an outstanding buffer or the range does not fit
    /// in it. See [`Self::try_read`] for a non-panicking version.
    pub fn read(&self, addr: usize, offset: usize, buf: &mut [u8]) {
        if let Err(e) = self.try_read(addr, offset, buf) {
            panic!("{}", e);
        }
    }

    /// The non-panicking version of [`Self::read`].
    ///
    /// # Errors
    ///
    ///  - [`Error::UnknownAddress`] if `addr` is not an outstanding buffer.
    ///  - [`Error::OutOfRange`] if the range does not fit in the buffer.
    ///
    pub fn try_read(&self, addr: usize, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        if buf.is_empty() {
            return Ok(());
        }

        let inner = self.inner.lock();

        if inner.translate(buf).is_some() {
            return Ok(());
        }

        let block = &inner.used.get(&addr).ok_or(Error::UnknownAddress(addr))?.block;
        check_access(block, addr, offset, buf.len())?;
        block.read(offset, buf);
        Ok(())
    }

    /// Copy `buf` into the buffer at `addr` starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not an outstanding buffer or the range does not fit
    /// in it. See [`Self::try_write`] for a non-panicking version.
    pub fn write(&self, addr: usize, offset: usize, buf: &[u8]) {
        if let Err(e) = self.try_write(addr, offset, buf) {
            panic!("{}", e);
        }
    }

    /// The non-panicking version of [`Self::write`].
    ///
    /// # Errors
    ///
    /// See [`Self::try_read`].
    pub fn try_write(&self, addr: usize, offset: usize, buf: &[u8]) -> Result<(), Error> {
        if buf.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        let block = &mut inner
            .used
            .get_mut(&addr)
            .ok_or(Error::UnknownAddress(addr))?
            .block;
        check_access(block, addr, offset, buf.len())?;
        block.write(offset, buf);
        Ok(())
    }

    /// Free the buffer at `addr`, which must have been allocated by
    /// [`Self::alloc`].
    ///
    /// Returns `true` if the buffer was freed. An address that is unknown or
    /// that denotes a reservation is ignored and `false` is returned.
    pub fn free(&self, addr: usize) -> bool {
        self.inner.lock().deallocate(addr, BlockKind::Allocated)
    }

    /// Release the buffer at `addr`, which must have been reserved by
    /// [`Self::reserve`].
    ///
    /// Returns `true` if the buffer was released. An address that is unknown
    /// or that denotes an allocation is ignored and `false` is returned.
    pub fn release(&self, addr: usize) -> bool {
        self.inner.lock().deallocate(addr, BlockKind::Reserved)
    }

    /// Get the state of the outstanding buffer at `addr`.
    pub fn kind_of(&self, addr: usize) -> Option<BlockKind> {
        self.inner.lock().used.get(&addr).map(|used| used.kind)
    }

    /// Get a snapshot of the free list, sorted by address.
    pub fn free_blocks(&self) -> Vec<Extent> {
        let inner = self.inner.lock();
        inner
            .free
            .iter()
            .map(|block| Extent::of(block, BlockKind::Free))
            .collect()
    }

    /// Get a snapshot of the outstanding buffers, sorted by address.
    pub fn used_blocks(&self) -> Vec<Extent> {
        let inner = self.inner.lock();
        inner
            .used
            .values()
            .map(|used| Extent::of(&used.block, used.kind))
            .collect()
    }

    /// Get the total size of the free blocks.
    pub fn free_bytes(&self) -> usize {
        self.inner.lock().free.iter().map(Block::size).sum()
    }
}

/// Check that `len` bytes at `offset` fit in `block`, the outstanding block at
/// `addr`.
fn check_access(block: &impl Block, addr: usize, offset: usize, len: usize) -> Result<(), Error> {
    if crate::utils::fits(offset, len, block.size()) {
        Ok(())
    } else {
        Err(Error::OutOfRange {
            addr,
            offset,
            len,
            size: block.size(),
        })
    }
}

impl<B: Block> Inner<B> {
    /// Translate a host slice into the address of its first byte if it lies
    /// within the region.
    fn translate(&self, buf: &[u8]) -> Option<usize> {
        if buf.is_empty() {
            return None;
        }
        let offset = (buf.as_ptr() as usize).checked_sub(self.base)?;
        let end = offset.checked_add(buf.len())?;
        (end <= self.size).then(|| self.start + offset)
    }

    /// Carve a `size`-byte block aligned to `align` out of the first free
    /// block that can hold it and record it in `used` as `kind`.
    fn allocate(&mut self, size: usize, align: usize, kind: BlockKind) -> Result<&mut B, Error> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }

        let align = match align {
            0 => DEFAULT_ALIGN,
            x if x.is_power_of_two() => x,
            x => return Err(Error::InvalidAlignment(x)),
        };

        // Find the first block that fits the request after padding
        let (mut i, pad) = self
            .free
            .iter()
            .enumerate()
            .find_map(|(i, block)| {
                let pad = align_padding(block.address(), align);
                let needed = size.checked_add(pad)?;
                (block.size() >= needed).then_some((i, pad))
            })
            .ok_or(Error::OutOfMemory { size, align })?;

        let mut block = self.free.remove(i);

        if pad != 0 {
            // The padding stays free in the same position.
            // Safety: `pad < block.size()`, and the fragment is cut off from
            //         `block` right away
            let head = unsafe {
                let head = block.fragment(0, pad);
                block.shrink(pad, pad);
                head
            };
            self.free.insert(i, head);
            i += 1;
        }

        let rest = block.size() - size;
        if rest != 0 {
            // The remainder stays free right after the padding (if any)
            // Safety: `size + rest == block.size()`, and the fragment is cut
            //         off from `block` right away
            let tail = unsafe {
                let tail = block.fragment(size, rest);
                block.shrink(0, rest);
                tail
            };
            self.free.insert(i, tail);
        }

        debug_assert_eq!(block.size(), size);
        debug_assert_eq!(block.address() % align, 0);
        log::trace!("{:?}: {:?} (align {})", kind, block, align);

        match self.used.entry(block.address()) {
            btree_map::Entry::Vacant(e) => Ok(&mut e.insert(Used { kind, block }).block),
            btree_map::Entry::Occupied(_) => {
                unreachable!("{:?} overlaps an outstanding block", block)
            }
        }
    }

    /// Return the outstanding block at `addr` of kind `kind` to the free
    /// list. Does nothing if there is no such block.
    fn deallocate(&mut self, addr: usize, kind: BlockKind) -> bool {
        let entry = match self.used.entry(addr) {
            btree_map::Entry::Occupied(e) => e,
            btree_map::Entry::Vacant(_) => {
                log::debug!("{:?}: {:#x} is not outstanding; ignored", kind, addr);
                return false;
            }
        };

        if entry.get().kind != kind {
            log::debug!(
                "{:?}: {:#x} is {:?}; ignored",
                kind,
                addr,
                entry.get().kind
            );
            return false;
        }

        let block = entry.remove().block;
        log::trace!("{:?} → Free: {:?}", kind, block);
        self.insert_free(block);
        true
    }

    /// Insert `block` into the free list at its sorted position and merge it
    /// with its address-adjacent neighbors.
    fn insert_free(&mut self, block: B) {
        let i = self
            .free
            .partition_point(|other| other.address() < block.address());
        self.free.insert(i, block);

        // Merge with the next block
        if let Some(next) = self.free.get(i + 1) {
            if self.free[i].end() == next.address() {
                let next = self.free.remove(i + 1);
                // Safety: `next` directly follows `free[i]` in the same window
                //         and is consumed here
                unsafe { self.free[i].grow(next.size()) };
            }
        }

        // Merge with the previous block
        if i > 0 && self.free[i - 1].end() == self.free[i].address() {
            let block = self.free.remove(i);
            // Safety: See above
            unsafe { self.free[i - 1].grow(block.size()) };
        }
    }
}

#[cfg(test)]
mod tests;
