mod common;

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

use vmfsio::volume::EXTENT_DATA_BASE;
use vmfsio::{Filesystem, Lvm, VmfsError, SEGMENT_SIZE};

#[test]
fn single_extent_read_maps_to_extent_offset() {
    let mut opts = common::small_geometry();
    opts.segments_per_extent = 4; // 1 GiB extent
    let (_dir, paths) = common::format_scratch(1, &opts);

    // Plant bytes at extent offset 0x1000 behind the volume's back.
    let pattern: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
    let raw = OpenOptions::new().write(true).open(&paths[0]).unwrap();
    raw.write_all_at(&pattern, EXTENT_DATA_BASE + 0x1000).unwrap();

    let lvm = common::open_lvm(&paths);
    lvm.open().unwrap();

    let mut buf = vec![0u8; 4096];
    lvm.read(0x1000, &mut buf).unwrap();
    assert_eq!(buf, pattern);
}

#[test]
fn reads_crossing_the_extent_end_are_rejected() {
    let mut opts = common::small_geometry();
    opts.segments_per_extent = 4;
    let (_dir, paths) = common::format_scratch(1, &opts);
    let lvm = common::open_lvm(&paths);

    let pos = 4 * SEGMENT_SIZE - 2048;
    let mut buf = vec![0u8; 4096];
    let err = lvm.read(pos, &mut buf).unwrap_err();
    assert!(matches!(err, VmfsError::SpansExtents { .. }));

    let err = lvm.write(pos, &buf).unwrap_err();
    assert!(matches!(err, VmfsError::SpansExtents { .. }));
}

#[test]
fn positions_beyond_the_volume_have_no_extent() {
    let (_dir, paths) = common::format_scratch(1, &common::small_geometry());
    let lvm = common::open_lvm(&paths);

    let mut buf = vec![0u8; 16];
    assert!(matches!(
        lvm.read(SEGMENT_SIZE, &mut buf),
        Err(VmfsError::NoExtent(_))
    ));
    assert!(matches!(
        lvm.reserve(SEGMENT_SIZE),
        Err(VmfsError::NoExtent(_))
    ));
}

#[test]
fn io_routes_to_the_covering_extent() {
    let (_dir, paths) = common::format_scratch(2, &common::small_geometry());

    let marker: Vec<u8> = (0..512).map(|i| (0x40 + i % 64) as u8).collect();
    let raw = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&paths[1])
        .unwrap();
    raw.write_all_at(&marker, EXTENT_DATA_BASE + 0x2000).unwrap();

    let lvm = common::open_lvm(&paths);
    lvm.open().unwrap();

    // Second segment lands on the second extent.
    let mut buf = vec![0u8; 512];
    lvm.read(SEGMENT_SIZE + 0x2000, &mut buf).unwrap();
    assert_eq!(buf, marker);

    // And writes come back through the raw file.
    lvm.write(SEGMENT_SIZE + 0x3000, &marker).unwrap();
    let mut raw_buf = vec![0u8; 512];
    raw.read_exact_at(&mut raw_buf, EXTENT_DATA_BASE + 0x3000)
        .unwrap();
    assert_eq!(raw_buf, marker);
}

#[test]
fn mismatched_extents_are_rejected() {
    let opts = common::small_geometry();
    let (_dir_a, paths_a) = common::format_scratch(2, &opts);
    let (_dir_b, paths_b) = common::format_scratch(2, &opts);

    let mut lvm = Lvm::new();
    lvm.add_extent(&paths_a[0]).unwrap();

    // The other set carries a different LVM UUID.
    let err = lvm.add_extent(&paths_b[1]).unwrap_err();
    assert!(matches!(err, VmfsError::MismatchedExtent(_)));

    // The set is unchanged and still completable.
    assert_eq!(lvm.loaded_extents(), 1);
    lvm.add_extent(&paths_a[1]).unwrap();
    lvm.open().unwrap();
}

#[test]
fn open_requires_every_extent() {
    let (_dir, paths) = common::format_scratch(2, &common::small_geometry());

    let mut lvm = Lvm::new();
    lvm.add_extent(&paths[0]).unwrap();
    assert!(matches!(
        lvm.open(),
        Err(VmfsError::MissingExtents {
            loaded: 1,
            expected: 2
        })
    ));

    // Mounting goes through the same check.
    assert!(matches!(
        Filesystem::open(lvm),
        Err(VmfsError::MissingExtents { .. })
    ));
}
