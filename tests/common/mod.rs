#![allow(dead_code)]

use std::path::PathBuf;

use tempfile::TempDir;
use vmfsio::{format_volume, Filesystem, FormatOptions, Lvm};

/// Small geometry so scenario tests touch several bitmap entries and
/// areas without large scratch files.
pub fn small_geometry() -> FormatOptions {
    FormatOptions {
        label: "scratch".to_string(),
        segments_per_extent: 1,
        block_size: 1024 * 1024,
        sub_block_size: 512,
        sub_blocks: 192,
        pointer_block_size: 512,
        pointer_blocks: 48,
        descriptor_size: 512,
        descriptors: 48,
        items_per_entry: 32,
        entries_per_area: 4,
    }
}

/// Format a fresh volume set in a tempdir and return its extent paths.
pub fn format_scratch(num_extents: usize, opts: &FormatOptions) -> (TempDir, Vec<PathBuf>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths: Vec<PathBuf> = (0..num_extents)
        .map(|i| dir.path().join(format!("extent{i}.vmfs")))
        .collect();
    format_volume(&paths, opts).expect("format");
    (dir, paths)
}

pub fn open_lvm(paths: &[PathBuf]) -> Lvm {
    let mut lvm = Lvm::new();
    for path in paths {
        lvm.add_extent(path).expect("add extent");
    }
    lvm
}

pub fn open_fs(paths: &[PathBuf]) -> Filesystem {
    Filesystem::open(open_lvm(paths)).expect("open filesystem")
}
