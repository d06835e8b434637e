mod common;

use std::collections::HashSet;

use vmfsio::iobuf::AlignedBuf;
use vmfsio::{BlockAddr, BlockId, BlockStatus, BlockType, VmfsError};

#[test]
fn sub_block_status_lifecycle() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);

    let id = BlockAddr::Sb { entry: 5, item: 17 }.encode();
    assert_eq!(fs.get_status(id).unwrap(), BlockStatus::Free);

    fs.alloc_specified(id).unwrap();
    assert_eq!(fs.get_status(id).unwrap(), BlockStatus::Allocated);

    fs.free(id).unwrap();
    assert_eq!(fs.get_status(id).unwrap(), BlockStatus::Free);
}

#[test]
fn status_updates_are_idempotent() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);

    let id = BlockAddr::Fd { entry: 0, item: 7 }.encode();
    fs.alloc_specified(id).unwrap();
    fs.alloc_specified(id).unwrap();
    assert_eq!(fs.get_status(id).unwrap(), BlockStatus::Allocated);

    fs.free(id).unwrap();
    fs.free(id).unwrap();
    assert_eq!(fs.get_status(id).unwrap(), BlockStatus::Free);

    // The free count survived the repeats: the item can be allocated.
    fs.alloc_specified(id).unwrap();
    assert_eq!(fs.get_status(id).unwrap(), BlockStatus::Allocated);
}

#[test]
fn alloc_and_free_are_inverse() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);

    for ty in [BlockType::Fb, BlockType::Sb, BlockType::Pb, BlockType::Fd] {
        let id = fs.alloc(ty).unwrap();
        assert_eq!(id.block_type().unwrap(), ty);
        assert_eq!(fs.get_status(id).unwrap(), BlockStatus::Allocated);

        fs.free(id).unwrap();
        assert_eq!(fs.get_status(id).unwrap(), BlockStatus::Free);
    }
}

#[test]
fn fresh_file_block_allocations_skip_reserved_metadata() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);

    // Block 0 holds the filesystem metadata and is allocated from birth.
    let meta = BlockAddr::Fb { item: 0 }.encode();
    assert_eq!(fs.get_status(meta).unwrap(), BlockStatus::Allocated);

    let id = fs.alloc(BlockType::Fb).unwrap();
    match id.decode().unwrap() {
        BlockAddr::Fb { item } => assert!(item >= 1),
        other => panic!("expected a file block, got {other:?}"),
    }
}

#[test]
fn alloc_exhaustion_reports_no_space() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);

    let mut seen = HashSet::new();
    for _ in 0..48 {
        let id = fs.alloc(BlockType::Fd).unwrap();
        assert!(seen.insert(id.raw()), "duplicate allocation {id}");
    }
    assert!(matches!(fs.alloc(BlockType::Fd), Err(VmfsError::NoSpace)));
}

#[test]
fn sub_block_write_read_modify_writes() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);

    let id = BlockAddr::Sb { entry: 0, item: 3 }.encode();
    let pattern: Vec<u8> = (0..512).map(|i| i as u8).collect();
    assert_eq!(fs.write_sb(id, 512, &pattern).unwrap(), 512);

    // A 3-byte write at pos 600 lands 88 bytes into the sub-block.
    assert_eq!(fs.write_sb(id, 600, b"abc").unwrap(), 3);

    let mut got = [0u8; 3];
    assert_eq!(fs.read_sb(id, 600, &mut got).unwrap(), 3);
    assert_eq!(&got, b"abc");

    // Everything around the write survived the read-modify-write.
    let mut full = vec![0u8; 512];
    assert_eq!(fs.read_sb(id, 0, &mut full).unwrap(), 512);
    let mut expect = pattern.clone();
    expect[88..91].copy_from_slice(b"abc");
    assert_eq!(full, expect);
}

#[test]
fn sub_block_io_caps_at_the_block_end() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);

    let id = BlockAddr::Sb { entry: 1, item: 0 }.encode();
    assert_eq!(fs.write_sb(id, 500, &[0x55u8; 100]).unwrap(), 12);

    let mut buf = vec![0u8; 100];
    assert_eq!(fs.read_sb(id, 500, &mut buf).unwrap(), 12);
    assert!(buf[..12].iter().all(|&b| b == 0x55));
}

#[test]
fn file_block_reads_match_reference_bytes() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);

    let blob: Vec<u8> = (0..8192).map(|i| (i * 7 % 253) as u8).collect();
    fs.write(2, 0, &blob).unwrap();
    let fb = BlockAddr::Fb { item: 2 }.encode();

    for (pos, len) in [
        (0u64, 512usize),
        (0, 8192),
        (1, 1),
        (511, 2),
        (600, 3),
        (512, 1024),
        (4095, 4097),
    ] {
        let mut buf = vec![0u8; len];
        let n = fs.read_fb(fb, pos, &mut buf).unwrap();
        assert_eq!(n, len, "length for read at {pos}");
        assert_eq!(
            buf[..n],
            blob[pos as usize..pos as usize + n],
            "bytes for read at {pos}"
        );
    }

    // Fully aligned requests take the direct path and see the same data.
    let mut aligned = AlignedBuf::for_dio(1024).unwrap();
    let n = fs.read_fb(fb, 512, aligned.as_mut_slice()).unwrap();
    assert_eq!(n, 1024);
    assert_eq!(aligned.as_slice(), &blob[512..1536]);

    // An aligned buffer with an unaligned length still returns the
    // logical length.
    let mut aligned = AlignedBuf::for_dio(1024).unwrap();
    let n = fs.read_fb(fb, 0, &mut aligned.as_mut_slice()[..700]).unwrap();
    assert_eq!(n, 700);
    assert_eq!(&aligned.as_slice()[..700], &blob[..700]);
}

#[test]
fn file_block_write_preserves_surrounding_bytes() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);

    let pattern: Vec<u8> = (0..4096).map(|i| (i % 199) as u8).collect();
    fs.write(3, 0, &pattern).unwrap();
    let fb = BlockAddr::Fb { item: 3 }.encode();

    assert_eq!(fs.write_fb(fb, 100, b"hello").unwrap(), 5);

    let mut back = vec![0u8; 4096];
    assert_eq!(fs.read_fb(fb, 0, &mut back).unwrap(), 4096);
    let mut expect = pattern.clone();
    expect[100..105].copy_from_slice(b"hello");
    assert_eq!(back, expect);
}

#[test]
fn file_block_io_caps_at_the_block_end() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);
    let bs = fs.blocksize();

    // Mark the first bytes of the next block so a spill would show.
    fs.write(5, 0, &[0xEEu8; 512]).unwrap();

    let fb = BlockAddr::Fb { item: 4 }.encode();
    assert_eq!(fs.write_fb(fb, bs - 2, &[0x11u8; 10]).unwrap(), 2);

    let mut tail = vec![0u8; 2];
    assert_eq!(fs.read_fb(fb, bs - 2, &mut tail).unwrap(), 2);
    assert_eq!(tail, [0x11, 0x11]);

    let mut next = vec![0u8; 512];
    fs.read(5, 0, &mut next).unwrap();
    assert!(next.iter().all(|&b| b == 0xEE));
}

#[test]
fn zeroize_fills_the_whole_block() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);
    let bs = fs.blocksize();

    fs.write(6, 0, &[0xAAu8; 4096]).unwrap();
    fs.write(6, bs - 512, &[0xBBu8; 512]).unwrap();

    let fb = BlockAddr::Fb { item: 6 }.encode();
    fs.zeroize_fb(fb).unwrap();

    let mut head = vec![0u8; 4096];
    fs.read(6, 0, &mut head).unwrap();
    assert!(head.iter().all(|&b| b == 0));
    let mut tail = vec![0u8; 512];
    fs.read(6, bs - 512, &mut tail).unwrap();
    assert!(tail.iter().all(|&b| b == 0));
}

#[test]
fn wrong_block_types_are_rejected() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let fs = common::open_fs(&paths);

    let sb = BlockAddr::Sb { entry: 0, item: 0 }.encode();
    let fb = BlockAddr::Fb { item: 1 }.encode();

    assert!(matches!(
        fs.zeroize_fb(sb),
        Err(VmfsError::InvalidBlockId(_))
    ));
    assert!(matches!(
        fs.read_sb(fb, 0, &mut [0u8; 4]),
        Err(VmfsError::InvalidBlockId(_))
    ));
    assert!(matches!(
        fs.free_pb(fb, 0, 1),
        Err(VmfsError::InvalidBlockId(_))
    ));
    assert!(matches!(
        fs.get_status(BlockId::from_raw(0)),
        Err(VmfsError::InvalidBlockId(0))
    ));
}
