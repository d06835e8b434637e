use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use uuid::Uuid;

use crate::bitmap::{
    Bitmap, BitmapEntry, BitmapHeader, BlockStatus, BITMAP_ENTRY_SIZE, BITMAP_HDR_SIZE,
    MAX_ITEMS_PER_ENTRY,
};
use crate::error::{Result, VmfsError};
use crate::fs::{FsInfo, FS_HDR_SIZE, FS_INFO_OFFSET};
use crate::iobuf::{align_up, M_DIO_BLK_SIZE};
use crate::lvm::SEGMENT_SIZE;
use crate::volume::{VolumeInfo, EXTENT_DATA_BASE, VOLUME_HDR_OFFSET, VOLUME_HDR_SIZE};

/// Highest file-block address expressible in a block ID.
const FB_ADDR_LIMIT: u64 = 1 << 26;
/// Largest item index expressible in an entry/item block ID.
const ITEM_LIMIT: u32 = 1 << 10;
/// Largest entry index expressible in an entry/item block ID.
const ENTRY_LIMIT: u32 = 1 << 16;

/// Logical offset of the first bitmap region.
const FIRST_BITMAP_BASE: u64 = 0x1_0000;
/// Alignment of bitmap region bases.
const REGION_ALIGN: u64 = 0x1000;

/// Geometry for a fresh volume set.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub label: String,
    /// Segments contributed by each extent (256 MiB apiece).
    pub segments_per_extent: u32,
    pub block_size: u64,
    pub sub_block_size: u32,
    pub sub_blocks: u32,
    pub pointer_block_size: u32,
    pub pointer_blocks: u32,
    pub descriptor_size: u32,
    pub descriptors: u32,
    pub items_per_entry: u32,
    pub entries_per_area: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            label: String::new(),
            segments_per_extent: 1,
            block_size: 1024 * 1024,
            sub_block_size: 4096,
            sub_blocks: 2048,
            pointer_block_size: 4096,
            pointer_blocks: 256,
            descriptor_size: 2048,
            descriptors: 1024,
            items_per_entry: 256,
            entries_per_area: 16,
        }
    }
}

impl FormatOptions {
    fn validate(&self, num_extents: usize) -> Result<()> {
        if num_extents == 0 || num_extents > u32::MAX as usize {
            return Err(bad_geometry("at least one extent is required"));
        }
        if self.segments_per_extent == 0 {
            return Err(bad_geometry("extents need at least one segment"));
        }
        let bs = self.block_size;
        if bs == 0
            || bs % M_DIO_BLK_SIZE as u64 != 0
            || SEGMENT_SIZE % bs != 0
            || bs > u32::MAX as u64
        {
            return Err(bad_geometry(format!("bad block size {bs}")));
        }
        for (name, size) in [
            ("sub-block", self.sub_block_size),
            ("pointer block", self.pointer_block_size),
            ("descriptor", self.descriptor_size),
        ] {
            if size == 0 || size as usize % M_DIO_BLK_SIZE != 0 {
                return Err(bad_geometry(format!("bad {name} size {size}")));
            }
        }
        for (name, count) in [
            ("sub-block", self.sub_blocks),
            ("pointer block", self.pointer_blocks),
            ("descriptor", self.descriptors),
        ] {
            if count == 0 {
                return Err(bad_geometry(format!("{name} count must be non-zero")));
            }
        }
        let ipbe = self.items_per_entry;
        if ipbe == 0 || ipbe % 8 != 0 || ipbe > MAX_ITEMS_PER_ENTRY || ipbe > ITEM_LIMIT {
            return Err(bad_geometry(format!("bad items_per_entry {ipbe}")));
        }
        if self.entries_per_area == 0 {
            return Err(bad_geometry("entries_per_area must be non-zero"));
        }
        Ok(())
    }

    fn bitmap_header(&self, total_items: u32, data_size: u32, payload: bool) -> Result<BitmapHeader> {
        let ipbe = self.items_per_entry;
        let epa = self.entries_per_area;
        let entry_space = epa as u64 * BITMAP_ENTRY_SIZE as u64;
        let area_size = if payload {
            entry_space + epa as u64 * ipbe as u64 * data_size as u64
        } else {
            entry_space
        };
        if area_size > u32::MAX as u64 {
            return Err(bad_geometry("bitmap area exceeds the on-disk field width"));
        }

        let entry_count = (total_items + ipbe - 1) / ipbe;
        if entry_count > ENTRY_LIMIT {
            return Err(bad_geometry(format!(
                "{entry_count} bitmap entries exceed the block id entry field"
            )));
        }
        Ok(BitmapHeader {
            items_per_bitmap_entry: ipbe,
            bmp_entries_per_area: epa,
            hdr_size: BITMAP_HDR_SIZE as u32,
            data_size,
            area_size: area_size as u32,
            area_count: (entry_count + epa - 1) / epa,
            total_items,
        })
    }
}

fn bad_geometry(detail: impl Into<String>) -> VmfsError {
    VmfsError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        detail.into(),
    ))
}

fn region_size(bmh: &BitmapHeader) -> u64 {
    bmh.hdr_size as u64 + bmh.area_count as u64 * bmh.area_size as u64
}

/// Create a fresh volume set on `paths`.
///
/// Every extent receives a volume header; the first one additionally
/// carries the filesystem header and the four bitmap regions, with all
/// items free except the file blocks covering the metadata itself.
pub fn format_volume(paths: &[impl AsRef<Path>], opts: &FormatOptions) -> Result<FsInfo> {
    opts.validate(paths.len())?;

    let num_extents = paths.len() as u32;
    let sps = opts.segments_per_extent;
    let extent_size = sps as u64 * SEGMENT_SIZE;
    let size = num_extents as u64 * extent_size;
    let total_blocks = size / opts.block_size;
    if total_blocks > FB_ADDR_LIMIT {
        return Err(bad_geometry(format!(
            "{total_blocks} file blocks exceed the block id address field"
        )));
    }

    let now = chrono::Utc::now().timestamp();
    let lvm_uuid = Uuid::new_v4();

    // Bitmap geometry and region placement on the logical volume.
    let fbb_bmh = opts.bitmap_header(total_blocks as u32, opts.block_size as u32, false)?;
    let sbc_bmh = opts.bitmap_header(opts.sub_blocks, opts.sub_block_size, true)?;
    let pbc_bmh = opts.bitmap_header(opts.pointer_blocks, opts.pointer_block_size, true)?;
    let fdc_bmh = opts.bitmap_header(opts.descriptors, opts.descriptor_size, true)?;

    let fbb_base = FIRST_BITMAP_BASE;
    let sbc_base = align_up(fbb_base + region_size(&fbb_bmh), REGION_ALIGN);
    let pbc_base = align_up(sbc_base + region_size(&sbc_bmh), REGION_ALIGN);
    let fdc_base = align_up(pbc_base + region_size(&pbc_bmh), REGION_ALIGN);
    let metadata_end = fdc_base + region_size(&fdc_bmh);
    if metadata_end > extent_size {
        return Err(bad_geometry("metadata does not fit inside the first extent"));
    }
    let reserved_blocks = (metadata_end + opts.block_size - 1) / opts.block_size;
    if reserved_blocks >= total_blocks {
        return Err(bad_geometry("metadata would consume every file block"));
    }

    // Stamp a volume header on every extent.
    for (i, path) in paths.iter().enumerate() {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(EXTENT_DATA_BASE + extent_size)?;

        let first_segment = i as u32 * sps;
        let info = VolumeInfo {
            uuid: Uuid::new_v4(),
            lvm_uuid,
            size,
            blocks: total_blocks,
            num_extents,
            first_segment,
            last_segment: first_segment + sps - 1,
            num_segments: sps,
            ctime: now,
        };
        let mut hdr = vec![0u8; VOLUME_HDR_SIZE];
        info.encode(&mut hdr);
        file.write_all_at(&hdr, VOLUME_HDR_OFFSET)?;
        file.sync_all()?;
    }

    // All filesystem metadata lands on the first extent.
    let meta = OpenOptions::new()
        .read(true)
        .write(true)
        .open(paths[0].as_ref())?;
    let write_meta = |pos: u64, buf: &[u8]| -> Result<()> {
        meta.write_all_at(buf, EXTENT_DATA_BASE + pos)?;
        Ok(())
    };

    let fs_info = FsInfo {
        uuid: Uuid::new_v4(),
        label: opts.label.clone(),
        block_size: opts.block_size,
        total_blocks,
        fbb_base,
        sbc_base,
        pbc_base,
        fdc_base,
    };
    let mut hdr = vec![0u8; FS_HDR_SIZE];
    fs_info.encode(&mut hdr);
    write_meta(FS_INFO_OFFSET, &hdr)?;

    for (name, bmh, base) in [
        ("fbb", &fbb_bmh, fbb_base),
        ("sbc", &sbc_bmh, sbc_base),
        ("pbc", &pbc_bmh, pbc_base),
        ("fdc", &fdc_bmh, fdc_base),
    ] {
        let mut rec = vec![0u8; BITMAP_HDR_SIZE];
        bmh.encode(&mut rec);
        write_meta(base, &rec)?;

        let bmp = Bitmap::new(name, base, bmh.clone());
        let mut entry_buf = vec![0u8; BITMAP_ENTRY_SIZE];
        for idx in 0..bmh.entry_count() {
            let governed = bmh.total_items - idx * bmh.items_per_bitmap_entry;
            let total = governed.min(bmh.items_per_bitmap_entry);
            let mut entry = BitmapEntry::new_free(idx, total, bmh, bmp.entry_pos(idx), now);

            // The file blocks holding this metadata are in use from birth.
            if name == "fbb" {
                let lo = idx as u64 * bmh.items_per_bitmap_entry as u64;
                let hi = (lo + total as u64).min(reserved_blocks);
                for blk in lo..hi {
                    bmp.set_item_status(&mut entry, 0, blk as u32, BlockStatus::Allocated)?;
                }
            }

            entry.encode(&mut entry_buf);
            write_meta(bmp.entry_pos(idx), &entry_buf)?;
        }
    }

    meta.sync_all()?;
    log::info!(
        "formatted {} extent(s): {} blocks of {} bytes, metadata below {metadata_end:#x}",
        num_extents,
        total_blocks,
        opts.block_size
    );
    Ok(fs_info)
}
