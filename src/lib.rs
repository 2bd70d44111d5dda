//! This crate implements a first-fit memory allocator for DMA buffers.
//!
//!  - **The memory is a fixed address window provided by the platform.**
//!    Typical sources include an on-chip SRAM carve-out or a device's
//!    memory-mapped buffer area that the program's heap never touches.
//!    Hardware descriptors hold raw addresses into this window, so every
//!    buffer stays where it was placed until it is returned.
//!
//!  - **Two allocation disciplines.** [`Region::alloc`] copies caller data
//!    into a freshly allocated buffer. [`Region::reserve`] hands out an
//!    uninitialized buffer backed directly by the window, and passing such a
//!    buffer back to [`Region::alloc`] costs nothing.
//!
//!  - **First-fit with maximal coalescing.** Free blocks are kept in address
//!    order; released blocks are merged with their neighbors immediately, so
//!    no two free blocks are ever adjacent.
//!
//!  - **This crate supports `#![no_std]`.** Bookkeeping lives in `alloc`
//!    collections; the window itself is never used for metadata.
//!
//! # Examples
//!
//! ```rust
//! use dmaregion::{HeapBlock, Region};
//!
//! // A hosted stand-in for a 4 KiB window at bus address 0x1000
//! let region = Region::new(HeapBlock::new(0x1000, 0x1000).unwrap());
//!
//! let (desc, buf) = region.reserve(256, 64).unwrap();
//! assert_eq!(desc, 0x1000);
//! assert_eq!(buf.len(), 256);
//!
//! let data = region.alloc(b"payload", 16).unwrap();
//! let mut out = [0u8; 7];
//! region.read(data, 0, &mut out);
//! assert_eq!(&out, b"payload");
//!
//! assert!(region.free(data));
//! assert!(region.release(desc));
//! assert_eq!(region.free_blocks().len(), 1);
//! ```
//!
//! On real hardware the window is described by a [`PhysBlock`], and the
//! [`global`] module keeps an application-wide default region.
//!
#![no_std]

extern crate alloc;

mod block;
mod error;
pub mod global;
mod heap;
mod init;
mod lock;
mod region;
mod utils;
pub use self::{
    block::{Block, BlockKind, PhysBlock},
    error::Error,
    heap::HeapBlock,
    init::*,
    region::{Extent, Region, DEFAULT_ALIGN},
};

#[cfg(any(test, feature = "std"))]
extern crate std;
