extern crate std;

use quickcheck_macros::quickcheck;
use std::{prelude::v1::*, sync::Arc, thread};

use super::*;
use crate::{tests::ShadowAllocator, HeapBlock};

fn region(start: usize, size: usize) -> Region<HeapBlock> {
    Region::new(HeapBlock::new(start, size).unwrap())
}

fn free_extent(address: usize, size: usize) -> Extent {
    Extent {
        address,
        size,
        kind: BlockKind::Free,
    }
}

#[test]
fn reserve_then_release_everything() {
    let _ = env_logger::builder().is_test(true).try_init();

    let region = region(0x1000, 0x1000);
    log::trace!("region = {:?}", region);

    let (a, buf) = region.reserve(256, 64).unwrap();
    assert_eq!(a, 0x1000);
    assert_eq!(buf.len(), 256);

    // The next free byte is already word-aligned
    let (b, _) = region.reserve(16, 0).unwrap();
    assert_eq!(b, 0x1100);
    assert_eq!(region.free_blocks(), [free_extent(0x1110, 0xef0)]);

    assert!(region.release(a));
    assert!(region.release(b));
    assert_eq!(region.free_blocks(), [free_extent(0x1000, 0x1000)]);
    assert!(region.used_blocks().is_empty());
}

#[test]
fn alignment_padding_stays_free() {
    let _ = env_logger::builder().is_test(true).try_init();

    let region = region(0x1004, 0x100);
    let addr = region.alloc(&[0x5a; 10], 16).unwrap();
    assert_eq!(addr, 0x1010);

    assert_eq!(
        region.free_blocks(),
        [free_extent(0x1004, 12), free_extent(0x101a, 0xea)]
    );
    assert_eq!(
        region.used_blocks(),
        [Extent {
            address: 0x1010,
            size: 10,
            kind: BlockKind::Allocated
        }]
    );

    // The padding is reused by a smaller request
    let small = region.alloc(&[1, 2, 3, 4], 4).unwrap();
    assert_eq!(small, 0x1004);

    assert!(region.free(addr));
    assert!(region.free(small));
    assert_eq!(region.free_blocks(), [free_extent(0x1004, 0x100)]);
}

#[test]
fn free_of_unknown_address_is_ignored() {
    let _ = env_logger::builder().is_test(true).try_init();

    let region = region(0x1000, 0x1000);
    let addr = region.alloc(b"data", 0).unwrap();
    let free_before = region.free_blocks();
    let used_before = region.used_blocks();

    assert!(!region.free(0xdead_0000));
    assert!(!region.release(0xdead_0000));
    // Inside a buffer, but not its address
    assert!(!region.free(addr + 1));

    assert_eq!(region.free_blocks(), free_before);
    assert_eq!(region.used_blocks(), used_before);
}

#[test]
fn kind_mismatch_is_ignored() {
    let region = region(0x1000, 0x1000);
    let (reserved, _) = region.reserve(32, 0).unwrap();
    let allocated = region.alloc(&[0; 32], 0).unwrap();

    assert!(!region.free(reserved));
    assert!(!region.release(allocated));
    assert_eq!(region.kind_of(reserved), Some(BlockKind::Reserved));
    assert_eq!(region.kind_of(allocated), Some(BlockKind::Allocated));

    assert!(region.release(reserved));
    assert!(region.free(allocated));
    assert_eq!(region.kind_of(reserved), None);

    // Double free
    assert!(!region.free(allocated));
}

#[test]
fn alloc_read_round_trip() {
    let region = region(0x8000_0000, 0x400);
    let data: Vec<u8> = (0..=255).collect();

    let addr = region.alloc(&data, 32).unwrap();
    assert_eq!(addr % 32, 0);

    let mut out = std::vec![0u8; data.len()];
    region.read(addr, 0, &mut out);
    assert_eq!(out, data);

    region.write(addr, 100, b"hello");
    let mut out = [0u8; 7];
    region.read(addr, 99, &mut out);
    assert_eq!(&out, &[99, b'h', b'e', b'l', b'l', b'o', 105]);
}

#[test]
fn alloc_of_reserved_buffer_is_free() {
    let region = region(0x1000, 0x1000);
    let (addr, buf) = region.reserve(64, 16).unwrap();
    let buf = unsafe { buf.as_ref() };

    assert_eq!(region.reserved(buf), Some(addr));
    assert_eq!(region.alloc(buf, 16), Ok(addr));
    assert_eq!(region.alloc(&buf[8..], 0), Ok(addr + 8));
    assert_eq!(region.used_blocks().len(), 1);

    assert_eq!(region.reserved(&[0u8; 4]), None);
    assert_eq!(region.reserved(&[]), None);
}

#[test]
fn reserved_buffer_is_backed_by_region() {
    let region = region(0x1000, 0x1000);
    let (addr, ptr) = region.reserve(16, 0).unwrap();

    // Slices over the buffer are re-derived after every access through the
    // region
    unsafe { &mut *ptr.as_ptr() }.copy_from_slice(b"0123456789abcdef");
    let mut out = [0u8; 6];
    region.read(addr, 10, &mut out);
    assert_eq!(&out, b"abcdef");

    region.write(addr, 0, b"xy");
    assert_eq!(&unsafe { ptr.as_ref() }[..4], b"xy23");

    // Reading into the reserved buffer itself leaves it untouched
    let other = region.alloc(b"zzzz", 0).unwrap();
    region.read(other, 0, &mut unsafe { &mut *ptr.as_ptr() }[..4]);
    assert_eq!(&unsafe { ptr.as_ref() }[..4], b"xy23");
}

#[test]
fn allocation_errors() {
    let region = region(0x1000, 0x100);

    assert_eq!(region.reserve(0, 0), Err(Error::ZeroSize));
    assert_eq!(region.alloc(&[], 0), Err(Error::ZeroSize));
    assert_eq!(region.reserve(16, 3), Err(Error::InvalidAlignment(3)));
    assert_eq!(region.alloc(&[0; 4], 48), Err(Error::InvalidAlignment(48)));
    assert_eq!(
        region.reserve(0x101, 0),
        Err(Error::OutOfMemory {
            size: 0x101,
            align: DEFAULT_ALIGN
        })
    );
    // Enough bytes, but not at this alignment
    assert_eq!(
        region.reserve(0x10, 0x2000),
        Err(Error::OutOfMemory {
            size: 0x10,
            align: 0x2000
        })
    );
    assert_eq!(region.free_blocks(), [free_extent(0x1000, 0x100)]);

    let (whole, _) = region.reserve(0x100, 0).unwrap();
    assert!(region.free_blocks().is_empty());
    assert!(matches!(
        region.reserve(1, 1),
        Err(Error::OutOfMemory { .. })
    ));
    assert!(region.release(whole));
}

#[test]
fn access_errors() {
    let region = region(0x1000, 0x100);
    let addr = region.alloc(&[0; 8], 0).unwrap();
    let mut buf = [0u8; 4];

    assert_eq!(
        region.try_read(0x1080, 0, &mut buf),
        Err(Error::UnknownAddress(0x1080))
    );
    assert_eq!(
        region.try_write(addr, 6, &buf),
        Err(Error::OutOfRange {
            addr,
            offset: 6,
            len: 4,
            size: 8
        })
    );
    assert_eq!(
        region.try_read(addr, usize::MAX, &mut buf),
        Err(Error::OutOfRange {
            addr,
            offset: usize::MAX,
            len: 4,
            size: 8
        })
    );
    assert_eq!(region.try_read(addr, 4, &mut buf), Ok(()));
    // Empty accesses never fail
    assert_eq!(region.try_write(0x1080, 0, &[]), Ok(()));
}

#[test]
#[should_panic(expected = "invalid access of 4 bytes at offset 6")]
fn read_past_end_panics() {
    let region = region(0x1000, 0x100);
    let addr = region.alloc(&[0; 8], 0).unwrap();
    region.read(addr, 6, &mut [0u8; 4]);
}

#[test]
#[should_panic(expected = "is not allocated")]
fn write_to_unknown_address_panics() {
    let region = region(0x1000, 0x100);
    region.write(0x1000, 0, b"x");
}

#[test]
fn coalesce_with_both_neighbors() {
    let region = region(0x1000, 0x30);
    let a = region.alloc(&[1; 0x10], 0).unwrap();
    let b = region.alloc(&[2; 0x10], 0).unwrap();
    let c = region.alloc(&[3; 0x10], 0).unwrap();
    assert!(region.free_blocks().is_empty());

    assert!(region.free(a));
    assert!(region.free(c));
    assert_eq!(
        region.free_blocks(),
        [free_extent(0x1000, 0x10), free_extent(0x1020, 0x10)]
    );

    assert!(region.free(b));
    assert_eq!(region.free_blocks(), [free_extent(0x1000, 0x30)]);
}

#[test]
fn every_power_of_two_alignment() {
    let region = region(0x1001, 0x10000);
    let mut addrs = Vec::new();
    for shift in 0..12 {
        let align = 1 << shift;
        let (addr, _) = region.reserve(3, align).unwrap();
        assert_eq!(addr % align, 0, "{:#x} is not aligned to {}", addr, align);
        addrs.push(addr);
    }
    for addr in addrs {
        assert!(region.release(addr));
    }
    assert_eq!(region.free_blocks(), [free_extent(0x1001, 0x10000)]);
}

#[test]
fn reset_and_reinit() {
    let region = region(0x1000, 0x1000);
    region.reserve(0x10, 0).unwrap();
    region.alloc(&[0; 0x20], 0x100).unwrap();
    region.reserve(0x30, 0).unwrap();
    assert_eq!(region.used_blocks().len(), 3);

    region.reset();
    assert!(region.used_blocks().is_empty());
    assert_eq!(region.free_blocks(), [free_extent(0x1000, 0x1000)]);
    assert_eq!(region.free_bytes(), 0x1000);

    region.alloc(&[0; 8], 0).unwrap();
    region.init(HeapBlock::new(0x4000, 0x200).unwrap());
    assert_eq!((region.start(), region.end(), region.size()), (0x4000, 0x4200, 0x200));
    assert!(region.used_blocks().is_empty());
    assert_eq!(region.reserve(8, 0).unwrap().0, 0x4000);
}

#[test]
fn empty_region() {
    let region: Region<HeapBlock> = Region::INIT;
    assert_eq!((region.start(), region.end(), region.size()), (0, 0, 0));
    assert!(matches!(
        region.reserve(1, 0),
        Err(Error::OutOfMemory { .. })
    ));
    assert!(!region.free(0));
    assert_eq!(region.reserved(&[1, 2, 3]), None);
    region.reset();
    assert!(region.free_blocks().is_empty());
}

#[test]
fn phys_region() {
    #[repr(align(64))]
    struct Pool([u8; 256]);
    let mut pool = Pool([0; 256]);
    let start = pool.0.as_mut_ptr() as usize;

    let region = unsafe { Region::from_raw_parts(start, pool.0.len()) }.unwrap();
    let addr = region.alloc(b"dma", 64).unwrap();
    assert_eq!(addr, start);

    let (res, buf) = region.reserve(8, 0).unwrap();
    assert_eq!(buf.as_ptr() as *mut u8 as usize, res);
    assert_eq!(region.reserved(unsafe { buf.as_ref() }), Some(res));

    assert!(region.free(addr));
    assert!(region.release(res));
    drop(region);
    assert_eq!(&pool.0[..3], b"dma");

    assert!(unsafe { Region::from_raw_parts(0, 16) }.is_err());
}

#[test]
fn concurrent_alloc_free() {
    let _ = env_logger::builder().is_test(true).try_init();

    let region = Arc::new(region(0x10_0000, 0x4000));
    let threads: Vec<_> = (0..4u8)
        .map(|t| {
            let region = Arc::clone(&region);
            thread::spawn(move || {
                for i in 0..500usize {
                    let data = std::vec![t; 1 + (i % 61)];
                    let addr = region.alloc(&data, 1 << (i % 5)).unwrap();
                    let mut out = std::vec![0u8; data.len()];
                    region.read(addr, 0, &mut out);
                    assert_eq!(out, data);
                    assert!(region.free(addr));
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(region.free_blocks(), [free_extent(0x10_0000, 0x4000)]);
}

#[test]
fn debug_output() {
    let region = region(0x1000, 0x40);
    region.reserve(0x10, 0).unwrap();
    let s = std::format!("{:?}", region);
    assert!(s.contains("Region"), "{}", s);
    assert!(s.contains("HeapBlock(0x1000+0x10)"), "{}", s);
}

#[quickcheck]
fn random(pool_start: usize, pool_size: usize, bytecode: Vec<u8>) {
    random_inner(pool_start, pool_size, bytecode);
}

fn random_inner(pool_start: usize, pool_size: usize, bytecode: Vec<u8>) -> Option<()> {
    let pool_start = 0x1000 + pool_start % 64;
    let pool_size = 1 + pool_size % 4096;
    let region = region(pool_start, pool_size);
    let mut sa = ShadowAllocator::new(pool_start..pool_start + pool_size);
    log::trace!("region = {:?}", region);

    #[derive(Debug)]
    struct Alloc {
        kind: BlockKind,
        addr: usize,
        size: usize,
        data: Option<Vec<u8>>,
    }
    let mut allocs = Vec::new();

    let result = (|| -> Option<()> {
        let mut it = bytecode.iter().cloned();
        loop {
            match it.next()? % 8 {
                op @ 0..=3 => {
                    let len = u16::from_le_bytes([it.next()?, it.next()?]);
                    let len = ((len as u64 * pool_size as u64) >> 16) as usize;
                    let align = match it.next()? {
                        x if x % 4 == 0 => 0,
                        x => 1 << (x % 8),
                    };
                    let effective_align = if align == 0 { DEFAULT_ALIGN } else { align };

                    // What first-fit must pick
                    let expected = region.free_blocks().into_iter().find_map(|f| {
                        let pad = align_padding(f.address, effective_align);
                        (f.size >= len + pad).then(|| f.address + pad)
                    });

                    let (kind, result) = if op < 2 {
                        log::trace!("reserve {} (align {})", len, align);
                        (
                            BlockKind::Reserved,
                            region.reserve(len, align).map(|(addr, _)| (addr, None)),
                        )
                    } else {
                        let data: Vec<u8> = (0..len).map(|i| (i as u8) ^ op).collect();
                        log::trace!("alloc {} (align {})", len, align);
                        (
                            BlockKind::Allocated,
                            region.alloc(&data, align).map(|addr| (addr, Some(data))),
                        )
                    };
                    log::trace!(" → {:x?}", result.as_ref().map(|x| x.0));

                    match result {
                        Ok((addr, data)) => {
                            assert_eq!(Some(addr), expected);
                            sa.allocate(kind, addr, len, effective_align);
                            allocs.push(Alloc {
                                kind,
                                addr,
                                size: len,
                                data,
                            });
                        }
                        Err(Error::ZeroSize) => assert_eq!(len, 0),
                        Err(Error::OutOfMemory { .. }) => assert_eq!(expected, None),
                        Err(e) => panic!("unexpected error {:?}", e),
                    }
                }
                4..=6 => {
                    let alloc_i = it.next()?;
                    if !allocs.is_empty() {
                        let alloc = allocs.swap_remove(alloc_i as usize % allocs.len());
                        log::trace!("dealloc {:x?}", alloc);

                        if let Some(data) = &alloc.data {
                            let mut out = std::vec![0u8; data.len()];
                            region.read(alloc.addr, 0, &mut out);
                            assert_eq!(&out, data);
                        }

                        let freed = match alloc.kind {
                            BlockKind::Reserved => region.release(alloc.addr),
                            _ => region.free(alloc.addr),
                        };
                        assert!(freed);
                        sa.deallocate(alloc.kind, alloc.addr, alloc.size);
                    }
                }
                7 => {
                    // Releasing with the wrong operation or at a wrong address
                    // must not change anything
                    let alloc_i = it.next()?;
                    if !allocs.is_empty() {
                        let alloc = &allocs[alloc_i as usize % allocs.len()];
                        let ignored = match alloc.kind {
                            BlockKind::Reserved => region.free(alloc.addr),
                            _ => region.release(alloc.addr),
                        };
                        assert!(!ignored);
                    }
                    assert!(!region.free(pool_start + pool_size));
                }
                _ => unreachable!(),
            }

            sa.check(&region.free_blocks(), &region.used_blocks());
        }
    })();

    // Returning everything must leave a single free block
    for alloc in allocs {
        match alloc.kind {
            BlockKind::Reserved => assert!(region.release(alloc.addr)),
            _ => assert!(region.free(alloc.addr)),
        }
    }
    assert_eq!(region.free_blocks(), [free_extent(pool_start, pool_size)]);

    result
}
