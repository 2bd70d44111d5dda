//! The application-wide default region.
//!
//! Drivers that do not thread a [`Region`] handle through their
//! configuration allocate from this region. It must be initialized by
//! platform code with [`init`] before any driver uses it, and it is never
//! torn down. Until then, every allocation fails with
//! [`Error::OutOfMemory`].
//!
//! Separate regions (e.g., in external RAM, or over a device's buffer
//! window) can be created with [`Region::from_raw_parts`].
//!
//! [`Error::OutOfMemory`]: crate::Error::OutOfMemory
use core::ptr::NonNull;

use crate::{Error, Init, PhysBlock, Region};

static DMA: Region<PhysBlock> = Region::INIT;

/// Initialize the default region to manage `[start, start + size)`.
///
/// Calling this again reinitializes the region and discards all outstanding
/// buffers.
///
/// # Errors
///
/// [`Error::InvalidRange`] if the window is empty, starts at address zero,
/// or wraps around the address space.
///
/// # Safety
///
/// See [`PhysBlock::new`].
pub unsafe fn init(start: usize, size: usize) -> Result<(), Error> {
    DMA.init(PhysBlock::new(start, size)?);
    Ok(())
}

/// Get the default region.
pub fn default() -> &'static Region<PhysBlock> {
    &DMA
}

/// [`Region::reserve`] on the default region.
pub fn reserve(size: usize, align: usize) -> Result<(usize, NonNull<[u8]>), Error> {
    DMA.reserve(size, align)
}

/// [`Region::reserved`] on the default region.
pub fn reserved(buf: &[u8]) -> Option<usize> {
    DMA.reserved(buf)
}

/// [`Region::alloc`] on the default region.
pub fn alloc(data: &[u8], align: usize) -> Result<usize, Error> {
    DMA.alloc(data, align)
}

/// [`Region::read`] on the default region.
pub fn read(addr: usize, offset: usize, buf: &mut [u8]) {
    DMA.read(addr, offset, buf)
}

/// [`Region::write`] on the default region.
pub fn write(addr: usize, offset: usize, buf: &[u8]) {
    DMA.write(addr, offset, buf)
}

/// [`Region::free`] on the default region.
pub fn free(addr: usize) -> bool {
    DMA.free(addr)
}

/// [`Region::release`] on the default region.
pub fn release(addr: usize) -> bool {
    DMA.release(addr)
}
