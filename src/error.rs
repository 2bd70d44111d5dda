use thiserror::Error;

/// The error type for region operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// No free block can hold the requested size at the requested alignment.
    #[error("out of memory ({size} bytes, {align}-byte alignment)")]
    OutOfMemory { size: usize, align: usize },

    /// The alignment is neither zero nor a power of two.
    #[error("invalid alignment {0} (must be zero or a power of two)")]
    InvalidAlignment(usize),

    /// A zero-byte allocation was requested.
    #[error("zero-sized allocation")]
    ZeroSize,

    /// The address range is empty, starts at zero, or wraps around.
    #[error("invalid address range {start:#x}+{size:#x}")]
    InvalidRange { start: usize, size: usize },

    /// The address does not denote an outstanding allocation or reservation.
    #[error("address {0:#x} is not allocated")]
    UnknownAddress(usize),

    /// The access does not fit in the block.
    #[error(
        "invalid access of {len} bytes at offset {offset} \
         of the {size}-byte block at {addr:#x}"
    )]
    OutOfRange {
        addr: usize,
        offset: usize,
        len: usize,
        size: usize,
    },
}
