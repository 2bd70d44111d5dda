/// The number of bytes needed to move `addr` up to the next multiple of
/// `align`.
///
/// `align` must be a power of two.
#[inline]
pub fn align_padding(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr.wrapping_neg() & (align - 1)
}

/// Get the one-past-end address of `[start, start + size)`, or `None` if the
/// range wraps around the address space.
#[inline]
pub fn checked_end(start: usize, size: usize) -> Option<usize> {
    start.checked_add(size)
}

/// Check that `offset..offset + len` lies within a `size`-byte extent.
#[inline]
pub fn fits(offset: usize, len: usize, size: usize) -> bool {
    matches!(offset.checked_add(len), Some(end) if end <= size)
}
