use serde::Serialize;

use crate::error::{Result, VmfsError};
use crate::fs::Filesystem;
use crate::iobuf::AlignedBuf;
use crate::lvm::Lvm;
use crate::metadata::{metadata_lock, metadata_unlock, MetadataHeader, METADATA_HDR_SIZE};

/// On-disk size of the bitmap header record.
pub const BITMAP_HDR_SIZE: usize = 512;
/// On-disk size of one bitmap entry record (metadata header included).
pub const BITMAP_ENTRY_SIZE: usize = 1024;

/// Byte offset of the entry body behind the metadata header.
const ENTRY_BODY_OFF: usize = METADATA_HDR_SIZE;
/// Byte offset of the item bit array within an entry record.
const ENTRY_BITS_OFF: usize = ENTRY_BODY_OFF + 16;
/// Largest item count one entry record can govern.
pub const MAX_ITEMS_PER_ENTRY: u32 = ((BITMAP_ENTRY_SIZE - ENTRY_BITS_OFF) * 8) as u32;

const BITMAP_MAGIC: &[u8; 8] = b"VMFSBMP\0";
const BITMAP_VERSION: u32 = 1;

/// Allocation state of one bitmap item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Free,
    Allocated,
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockStatus::Free => write!(f, "free"),
            BlockStatus::Allocated => write!(f, "allocated"),
        }
    }
}

/// Immutable per-open bitmap geometry.
///
/// A bitmap is a flat array of entries grouped into fixed-size areas.
/// Area `a` starts at `hdr_size + a * area_size` past the bitmap base
/// and holds `bmp_entries_per_area` entry records followed by the item
/// payload region (absent for bitmaps whose items live elsewhere, like
/// the file-block bitmap).
#[derive(Debug, Clone, Serialize)]
pub struct BitmapHeader {
    pub items_per_bitmap_entry: u32,
    pub bmp_entries_per_area: u32,
    /// Distance from the bitmap base to the first area.
    pub hdr_size: u32,
    /// Bytes per item payload.
    pub data_size: u32,
    pub area_size: u32,
    pub area_count: u32,
    pub total_items: u32,
}

impl BitmapHeader {
    /// Number of entries needed to govern `total_items`.
    pub fn entry_count(&self) -> u32 {
        (self.total_items + self.items_per_bitmap_entry - 1) / self.items_per_bitmap_entry
    }

    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= BITMAP_HDR_SIZE);
        buf[..BITMAP_HDR_SIZE].fill(0);
        buf[0..8].copy_from_slice(BITMAP_MAGIC);
        buf[8..12].copy_from_slice(&BITMAP_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.items_per_bitmap_entry.to_le_bytes());
        buf[16..20].copy_from_slice(&self.bmp_entries_per_area.to_le_bytes());
        buf[20..24].copy_from_slice(&self.hdr_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.data_size.to_le_bytes());
        buf[28..32].copy_from_slice(&self.area_size.to_le_bytes());
        buf[32..36].copy_from_slice(&self.area_count.to_le_bytes());
        buf[36..40].copy_from_slice(&self.total_items.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..40]);
        buf[40..44].copy_from_slice(&crc.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BITMAP_HDR_SIZE {
            return Err(VmfsError::corrupt("bitmap header record truncated"));
        }
        if &buf[0..8] != BITMAP_MAGIC {
            return Err(VmfsError::corrupt("bitmap header magic mismatch"));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != BITMAP_VERSION {
            return Err(VmfsError::corrupt(format!(
                "unsupported bitmap header version {version}"
            )));
        }
        let stored_crc = u32::from_le_bytes(buf[40..44].try_into().unwrap());
        if crc32fast::hash(&buf[0..40]) != stored_crc {
            return Err(VmfsError::corrupt("bitmap header checksum mismatch"));
        }

        let bmh = BitmapHeader {
            items_per_bitmap_entry: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            bmp_entries_per_area: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            hdr_size: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            data_size: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            area_size: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            area_count: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            total_items: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
        };
        bmh.validate()?;
        Ok(bmh)
    }

    fn validate(&self) -> Result<()> {
        let ipbe = self.items_per_bitmap_entry;
        if ipbe == 0 || ipbe % 8 != 0 || ipbe > MAX_ITEMS_PER_ENTRY {
            return Err(VmfsError::corrupt(format!(
                "bad items_per_bitmap_entry {ipbe}"
            )));
        }
        if self.bmp_entries_per_area == 0 {
            return Err(VmfsError::corrupt("bitmap declares zero entries per area"));
        }
        if self.total_items == 0 || self.data_size == 0 {
            return Err(VmfsError::corrupt("bitmap declares no items"));
        }
        if (self.hdr_size as usize) < BITMAP_HDR_SIZE {
            return Err(VmfsError::corrupt("bitmap hdr_size too small"));
        }
        let entry_space = self.bmp_entries_per_area as u64 * BITMAP_ENTRY_SIZE as u64;
        if (self.area_size as u64) < entry_space {
            return Err(VmfsError::corrupt("bitmap area smaller than its entry table"));
        }
        if self.area_count as u64 * (self.bmp_entries_per_area as u64) < self.entry_count() as u64 {
            return Err(VmfsError::corrupt("bitmap areas do not cover all entries"));
        }
        Ok(())
    }
}

/// One bitmap entry, materialized from disk.
///
/// Entries are copy-out/copy-back values. The on-disk record under the
/// metadata lock is canonical; nothing caches an entry across calls.
#[derive(Debug, Clone)]
pub struct BitmapEntry {
    pub id: u32,
    /// Items governed by this entry (the last entry may be partial).
    pub total: u32,
    pub free: u32,
    /// First-free scan hint, best effort.
    pub ffree: u32,
    pub mdh: MetadataHeader,
    bits: Vec<u8>,
}

impl BitmapEntry {
    pub fn decode(
        buf: &[u8],
        expected_pos: u64,
        expected_id: u32,
        bmh: &BitmapHeader,
    ) -> Result<Self> {
        if buf.len() < BITMAP_ENTRY_SIZE {
            return Err(VmfsError::corrupt("bitmap entry record truncated"));
        }
        let mdh = MetadataHeader::decode(&buf[..METADATA_HDR_SIZE], expected_pos)?;
        let id = u32::from_le_bytes(buf[ENTRY_BODY_OFF..ENTRY_BODY_OFF + 4].try_into().unwrap());
        let total =
            u32::from_le_bytes(buf[ENTRY_BODY_OFF + 4..ENTRY_BODY_OFF + 8].try_into().unwrap());
        let free =
            u32::from_le_bytes(buf[ENTRY_BODY_OFF + 8..ENTRY_BODY_OFF + 12].try_into().unwrap());
        let ffree =
            u32::from_le_bytes(buf[ENTRY_BODY_OFF + 12..ENTRY_BODY_OFF + 16].try_into().unwrap());

        if id != expected_id {
            return Err(VmfsError::corrupt(format!(
                "bitmap entry at {expected_pos:#x} claims id {id}, expected {expected_id}"
            )));
        }
        if total > bmh.items_per_bitmap_entry || free > total {
            return Err(VmfsError::corrupt(format!(
                "bitmap entry {id} counts are inconsistent (total {total}, free {free})"
            )));
        }

        let nbytes = (bmh.items_per_bitmap_entry as usize + 7) / 8;
        Ok(BitmapEntry {
            id,
            total,
            free,
            ffree,
            mdh,
            bits: buf[ENTRY_BITS_OFF..ENTRY_BITS_OFF + nbytes].to_vec(),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= BITMAP_ENTRY_SIZE);
        buf[..BITMAP_ENTRY_SIZE].fill(0);
        self.mdh.encode(&mut buf[..METADATA_HDR_SIZE]);
        buf[ENTRY_BODY_OFF..ENTRY_BODY_OFF + 4].copy_from_slice(&self.id.to_le_bytes());
        buf[ENTRY_BODY_OFF + 4..ENTRY_BODY_OFF + 8].copy_from_slice(&self.total.to_le_bytes());
        buf[ENTRY_BODY_OFF + 8..ENTRY_BODY_OFF + 12].copy_from_slice(&self.free.to_le_bytes());
        buf[ENTRY_BODY_OFF + 12..ENTRY_BODY_OFF + 16].copy_from_slice(&self.ffree.to_le_bytes());
        buf[ENTRY_BITS_OFF..ENTRY_BITS_OFF + self.bits.len()].copy_from_slice(&self.bits);
    }

    /// A freshly formatted entry with all governed items free.
    pub fn new_free(id: u32, total: u32, bmh: &BitmapHeader, pos: u64, mtime: i64) -> Self {
        let nbytes = (bmh.items_per_bitmap_entry as usize + 7) / 8;
        let mut entry = BitmapEntry {
            id,
            total,
            free: total,
            ffree: 0,
            mdh: MetadataHeader::new(pos, mtime),
            bits: vec![0u8; nbytes],
        };
        for item in 0..total {
            entry.set_bit(item);
        }
        entry
    }

    /// Whether the bit for `item` is set. Set bit = free item.
    fn bit(&self, item: u32) -> bool {
        let byte = self.bits[(item / 8) as usize];
        byte & (1u8 << (item % 8)) != 0
    }

    fn set_bit(&mut self, item: u32) {
        self.bits[(item / 8) as usize] |= 1u8 << (item % 8);
    }

    fn clear_bit(&mut self, item: u32) {
        self.bits[(item / 8) as usize] &= !(1u8 << (item % 8));
    }

    /// Claim the first free item of this entry.
    pub fn alloc_item(&mut self) -> Result<u32> {
        let start = if self.ffree < self.total { self.ffree } else { 0 };
        for item in (start..self.total).chain(0..start) {
            if self.bit(item) {
                self.clear_bit(item);
                self.free = self.free.saturating_sub(1);
                self.ffree = item + 1;
                return Ok(item);
            }
        }
        Err(VmfsError::NoSpace)
    }

    /// Persist this entry at its on-disk position.
    pub(crate) fn write(&self, fs: &Filesystem) -> Result<()> {
        let mut buf = AlignedBuf::for_dio(BITMAP_ENTRY_SIZE)?;
        self.encode(buf.as_mut_slice());
        fs.write_at(self.mdh.pos, buf.as_slice())
    }
}

/// One of the four on-disk allocators of a mounted filesystem.
pub struct Bitmap {
    name: &'static str,
    /// Logical offset of the bitmap region on the volume.
    base: u64,
    bmh: BitmapHeader,
}

impl Bitmap {
    pub(crate) fn new(name: &'static str, base: u64, bmh: BitmapHeader) -> Bitmap {
        Bitmap { name, base, bmh }
    }

    /// Read and validate the bitmap header at `base`.
    pub(crate) fn open(lvm: &Lvm, name: &'static str, base: u64) -> Result<Bitmap> {
        let mut buf = AlignedBuf::for_dio(BITMAP_HDR_SIZE)?;
        lvm.read(base, buf.as_mut_slice())?;
        let bmh = BitmapHeader::decode(buf.as_slice())?;
        log::debug!(
            "opened bitmap {name} at {base:#x}: {} items, {} per entry",
            bmh.total_items,
            bmh.items_per_bitmap_entry
        );
        Ok(Bitmap { name, base, bmh })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn header(&self) -> &BitmapHeader {
        &self.bmh
    }

    /// Logical position of an entry record.
    pub fn entry_pos(&self, entry_idx: u32) -> u64 {
        let area = entry_idx / self.bmh.bmp_entries_per_area;
        let in_area = entry_idx % self.bmh.bmp_entries_per_area;
        self.base
            + self.bmh.hdr_size as u64
            + area as u64 * self.bmh.area_size as u64
            + in_area as u64 * BITMAP_ENTRY_SIZE as u64
    }

    /// Logical position of an item payload. Indices must already be
    /// folded (`item < items_per_bitmap_entry`).
    pub fn item_pos(&self, entry_idx: u32, item_idx: u32) -> u64 {
        let ipbe = self.bmh.items_per_bitmap_entry as u64;
        let per_area = ipbe * self.bmh.bmp_entries_per_area as u64;
        let addr = entry_idx as u64 * ipbe + item_idx as u64;
        let area = addr / per_area;
        self.base
            + self.bmh.hdr_size as u64
            + area * self.bmh.area_size as u64
            + self.bmh.bmp_entries_per_area as u64 * BITMAP_ENTRY_SIZE as u64
            + (addr - area * per_area) * self.bmh.data_size as u64
    }

    /// Normalize an (entry, item) pair so the item index lands inside
    /// its governing entry. File-block IDs arrive as (0, flat address).
    fn fold(&self, entry: u32, item: u32) -> (u32, u32) {
        let ipbe = self.bmh.items_per_bitmap_entry as u64;
        let addr = entry as u64 * ipbe + item as u64;
        ((addr / ipbe) as u32, (addr % ipbe) as u32)
    }

    fn check_addr(&self, entry: u32, item: u32) -> Result<(u32, u32)> {
        let (e, i) = self.fold(entry, item);
        let addr = e as u64 * self.bmh.items_per_bitmap_entry as u64 + i as u64;
        if addr >= self.bmh.total_items as u64 {
            return Err(VmfsError::corrupt(format!(
                "item ({entry}, {item}) is beyond the {} bitmap ({} items)",
                self.name, self.bmh.total_items
            )));
        }
        Ok((e, i))
    }

    /// Load the entry governing (entry, item) from disk.
    pub fn get_entry(&self, fs: &Filesystem, entry: u32, item: u32) -> Result<BitmapEntry> {
        let (e, _) = self.check_addr(entry, item)?;
        self.read_entry(fs, e)
    }

    pub(crate) fn read_entry(&self, fs: &Filesystem, entry_idx: u32) -> Result<BitmapEntry> {
        if entry_idx >= self.bmh.entry_count() {
            return Err(VmfsError::corrupt(format!(
                "entry {entry_idx} is beyond the {} bitmap ({} entries)",
                self.name,
                self.bmh.entry_count()
            )));
        }
        let pos = self.entry_pos(entry_idx);
        let mut buf = AlignedBuf::for_dio(BITMAP_ENTRY_SIZE)?;
        fs.read_at(pos, buf.as_mut_slice())?;
        BitmapEntry::decode(buf.as_slice(), pos, entry_idx, &self.bmh)
    }

    /// Read one item payload into `buf` (exactly `data_size` bytes).
    pub fn get_item(&self, fs: &Filesystem, entry: u32, item: u32, buf: &mut [u8]) -> Result<()> {
        assert_eq!(buf.len(), self.bmh.data_size as usize);
        let (e, i) = self.check_addr(entry, item)?;
        fs.read_at(self.item_pos(e, i), buf)
    }

    /// Write one item payload from `buf` (exactly `data_size` bytes).
    pub fn set_item(&self, fs: &Filesystem, entry: u32, item: u32, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len(), self.bmh.data_size as usize);
        let (e, i) = self.check_addr(entry, item)?;
        fs.write_at(self.item_pos(e, i), buf)
    }

    /// Report the allocation state of one item from a loaded entry.
    pub fn get_item_status(
        &self,
        entry: &BitmapEntry,
        blk_entry: u32,
        blk_item: u32,
    ) -> Result<BlockStatus> {
        let item = self.entry_local_item(entry, blk_entry, blk_item)?;
        Ok(if entry.bit(item) {
            BlockStatus::Free
        } else {
            BlockStatus::Allocated
        })
    }

    /// Flip one item to `status` in a loaded entry.
    ///
    /// Setting an item to its current state is a no-op; the free count
    /// only moves when a bit actually flips.
    pub fn set_item_status(
        &self,
        entry: &mut BitmapEntry,
        blk_entry: u32,
        blk_item: u32,
        status: BlockStatus,
    ) -> Result<()> {
        let item = self.entry_local_item(entry, blk_entry, blk_item)?;
        match status {
            BlockStatus::Allocated => {
                if entry.bit(item) {
                    entry.clear_bit(item);
                    entry.free = entry.free.saturating_sub(1);
                }
            }
            BlockStatus::Free => {
                if !entry.bit(item) {
                    entry.set_bit(item);
                    entry.free += 1;
                    entry.ffree = entry.ffree.min(item);
                }
            }
        }
        Ok(())
    }

    fn entry_local_item(&self, entry: &BitmapEntry, blk_entry: u32, blk_item: u32) -> Result<u32> {
        let (e, i) = self.fold(blk_entry, blk_item);
        if e != entry.id {
            return Err(VmfsError::corrupt(format!(
                "item ({blk_entry}, {blk_item}) is not governed by entry {}",
                entry.id
            )));
        }
        if i >= entry.total {
            return Err(VmfsError::corrupt(format!(
                "item {i} is beyond entry {} ({} items)",
                entry.id, entry.total
            )));
        }
        Ok(i)
    }

    /// Find an entry with at least `n` free items and return it with its
    /// metadata lock held. Entries locked by other hosts are skipped.
    ///
    /// The entry is re-read under the lock, so the returned snapshot is
    /// current until the caller releases it.
    pub fn find_free_items(&self, fs: &Filesystem, n: u32) -> Result<BitmapEntry> {
        assert!(n > 0);
        for idx in 0..self.bmh.entry_count() {
            let mut entry = self.read_entry(fs, idx)?;
            if entry.free < n {
                continue;
            }
            match metadata_lock(fs, &mut entry.mdh) {
                Ok(()) => {}
                Err(VmfsError::LockContended) => {
                    log::debug!("{} entry {idx} contended, trying the next one", self.name);
                    continue;
                }
                Err(e) => return Err(e),
            }

            match self.read_entry(fs, idx) {
                Ok(fresh) if fresh.free >= n => return Ok(fresh),
                Ok(mut fresh) => {
                    // Lost the race between peek and lock.
                    metadata_unlock(fs, &mut fresh.mdh)?;
                }
                Err(e) => {
                    let mut mdh = entry.mdh;
                    let _ = metadata_unlock(fs, &mut mdh);
                    return Err(e);
                }
            }
        }
        Err(VmfsError::NoSpace)
    }
}
