use std::fmt;
use std::str::FromStr;

use crate::bitmap::{Bitmap, BlockStatus};
use crate::error::{Result, VmfsError};
use crate::fs::Filesystem;
use crate::iobuf::{align_down, align_up, ptr_is_aligned, AlignedBuf, M_DIO_BLK_SIZE};
use crate::metadata::{metadata_lock, metadata_unlock};

const BLK_TYPE_MASK: u32 = 0x07;
const BLK_TYPE_FB: u32 = 1;
const BLK_TYPE_SB: u32 = 2;
const BLK_TYPE_PB: u32 = 3;
const BLK_TYPE_FD: u32 = 4;

const BLK_FIELD_SHIFT: u32 = 6;
const BLK_FB_ITEM_MAX: u32 = (1 << 26) - 1;
const BLK_ENTRY_MAX: u32 = (1 << 16) - 1;
const BLK_ITEM_SHIFT: u32 = 22;
const BLK_ITEM_MAX: u32 = (1 << 10) - 1;

/// The four block categories a block ID can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// File block: bulk data.
    Fb,
    /// Sub-block: small-file storage.
    Sb,
    /// Pointer block: an array of block IDs for indirection.
    Pb,
    /// File descriptor: the inode record.
    Fd,
}

/// A packed 32-bit block identifier.
///
/// The low 3 bits carry the type; the remaining fields depend on it.
/// `decode` and `BlockAddr::encode` are exact inverses.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(u32);

/// A decoded block identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAddr {
    Fb { item: u32 },
    Sb { entry: u32, item: u32 },
    Pb { entry: u32, item: u32 },
    Fd { entry: u32, item: u32 },
}

impl BlockId {
    pub const fn from_raw(raw: u32) -> BlockId {
        BlockId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Extract the typed fields, rejecting unknown type tags.
    pub fn decode(self) -> Result<BlockAddr> {
        let entry = (self.0 >> BLK_FIELD_SHIFT) & BLK_ENTRY_MAX;
        let item = (self.0 >> BLK_ITEM_SHIFT) & BLK_ITEM_MAX;
        match self.0 & BLK_TYPE_MASK {
            BLK_TYPE_FB => Ok(BlockAddr::Fb {
                item: self.0 >> BLK_FIELD_SHIFT,
            }),
            BLK_TYPE_SB => Ok(BlockAddr::Sb { entry, item }),
            BLK_TYPE_PB => Ok(BlockAddr::Pb { entry, item }),
            BLK_TYPE_FD => Ok(BlockAddr::Fd { entry, item }),
            _ => Err(VmfsError::InvalidBlockId(self.0)),
        }
    }

    pub fn block_type(self) -> Result<BlockType> {
        Ok(self.decode()?.block_type())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({:#010x})", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl FromStr for BlockId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let raw = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16)?,
            None => s.parse()?,
        };
        Ok(BlockId(raw))
    }
}

impl BlockAddr {
    /// Pack into the 32-bit wire form.
    pub fn encode(self) -> BlockId {
        let raw = match self {
            BlockAddr::Fb { item } => {
                debug_assert!(item <= BLK_FB_ITEM_MAX);
                (item << BLK_FIELD_SHIFT) | BLK_TYPE_FB
            }
            BlockAddr::Sb { entry, item } => pack_entry_item(entry, item, BLK_TYPE_SB),
            BlockAddr::Pb { entry, item } => pack_entry_item(entry, item, BLK_TYPE_PB),
            BlockAddr::Fd { entry, item } => pack_entry_item(entry, item, BLK_TYPE_FD),
        };
        BlockId(raw)
    }

    pub fn block_type(self) -> BlockType {
        match self {
            BlockAddr::Fb { .. } => BlockType::Fb,
            BlockAddr::Sb { .. } => BlockType::Sb,
            BlockAddr::Pb { .. } => BlockType::Pb,
            BlockAddr::Fd { .. } => BlockType::Fd,
        }
    }
}

fn pack_entry_item(entry: u32, item: u32, tag: u32) -> u32 {
    debug_assert!(entry <= BLK_ENTRY_MAX);
    debug_assert!(item <= BLK_ITEM_MAX);
    (entry << BLK_FIELD_SHIFT) | (item << BLK_ITEM_SHIFT) | tag
}

impl Filesystem {
    /// The bitmap backing one block category.
    pub fn bitmap_for(&self, ty: BlockType) -> &Bitmap {
        match ty {
            BlockType::Fb => &self.fbb,
            BlockType::Sb => &self.sbc,
            BlockType::Pb => &self.pbc,
            BlockType::Fd => &self.fdc,
        }
    }

    /// Resolve a block ID to its bitmap and (entry, item) coordinates.
    pub fn get_bitmap_info(&self, id: BlockId) -> Result<(&Bitmap, u32, u32)> {
        Ok(match id.decode()? {
            BlockAddr::Fb { item } => (&self.fbb, 0, item),
            BlockAddr::Sb { entry, item } => (&self.sbc, entry, item),
            BlockAddr::Pb { entry, item } => (&self.pbc, entry, item),
            BlockAddr::Fd { entry, item } => (&self.fdc, entry, item),
        })
    }

    /// Report whether a block is allocated or free. Takes no lock.
    pub fn get_status(&self, id: BlockId) -> Result<BlockStatus> {
        let (bmp, entry, item) = self.get_bitmap_info(id)?;
        let bme = bmp.get_entry(self, entry, item)?;
        bmp.get_item_status(&bme, entry, item)
    }

    /// Flip a block to `status` under the entry's metadata lock.
    fn set_status(&self, id: BlockId, status: BlockStatus) -> Result<()> {
        let (bmp, entry, item) = self.get_bitmap_info(id)?;
        let mut bme = bmp.get_entry(self, entry, item)?;

        metadata_lock(self, &mut bme.mdh)?;
        let res = bmp
            .set_item_status(&mut bme, entry, item, status)
            .and_then(|_| bme.write(self));
        let unlock = metadata_unlock(self, &mut bme.mdh);
        res?;
        unlock
    }

    /// Mark the given block allocated.
    pub fn alloc_specified(&self, id: BlockId) -> Result<()> {
        self.set_status(id, BlockStatus::Allocated)
    }

    /// Mark the given block free.
    pub fn free(&self, id: BlockId) -> Result<()> {
        self.set_status(id, BlockStatus::Free)
    }

    /// Allocate one block of the given category and return its ID.
    pub fn alloc(&self, ty: BlockType) -> Result<BlockId> {
        let bmp = self.bitmap_for(ty);
        let mut bme = bmp.find_free_items(self, 1)?;

        let item = match bme.alloc_item() {
            Ok(item) => item,
            Err(e) => {
                metadata_unlock(self, &mut bme.mdh)?;
                return Err(e);
            }
        };
        let res = bme.write(self);
        let unlock = metadata_unlock(self, &mut bme.mdh);
        res?;
        unlock?;

        let addr = match ty {
            BlockType::Fb => BlockAddr::Fb {
                item: bme.id * bmp.header().items_per_bitmap_entry + item,
            },
            BlockType::Sb => BlockAddr::Sb { entry: bme.id, item },
            BlockType::Pb => BlockAddr::Pb { entry: bme.id, item },
            BlockType::Fd => BlockAddr::Fd { entry: bme.id, item },
        };
        Ok(addr.encode())
    }

    /// Overwrite a file block with zeros, one direct-I/O unit at a time.
    pub fn zeroize_fb(&self, id: BlockId) -> Result<()> {
        let item = match id.decode()? {
            BlockAddr::Fb { item } => item,
            _ => return Err(VmfsError::InvalidBlockId(id.raw())),
        };

        let chunk = AlignedBuf::for_dio(M_DIO_BLK_SIZE)?;
        let len = self.blocksize();
        let mut pos = 0u64;
        while pos < len {
            self.write(item, pos, chunk.as_slice())?;
            pos += M_DIO_BLK_SIZE as u64;
        }
        Ok(())
    }

    /// Free every block referenced by slots `[start, end)` of a pointer
    /// block, zeroing the freed slots. Covering the whole pointer block
    /// frees the pointer block itself; otherwise the modified payload is
    /// persisted. Returns how many non-zero slots were found.
    pub fn free_pb(&self, pb_blk: BlockId, start: usize, end: usize) -> Result<usize> {
        let (pbc_entry, pbc_item) = match pb_blk.decode()? {
            BlockAddr::Pb { entry, item } => (entry, item),
            _ => return Err(VmfsError::InvalidBlockId(pb_blk.raw())),
        };

        let data_size = self.pbc.header().data_size as usize;
        let slots = data_size / 4;
        if start > end || end > slots {
            return Err(VmfsError::corrupt(format!(
                "pointer block slot range {start}..{end} exceeds {slots} slots"
            )));
        }

        let mut buf = AlignedBuf::for_dio(data_size)?;
        self.pbc.get_item(self, pbc_entry, pbc_item, buf.as_mut_slice())?;

        let mut count = 0;
        for slot in start..end {
            let off = slot * 4;
            let blk = u32::from_le_bytes(buf.as_slice()[off..off + 4].try_into().unwrap());
            if blk != 0 {
                self.free(BlockId::from_raw(blk))?;
                buf.as_mut_slice()[off..off + 4].fill(0);
                count += 1;
            }
        }

        if start == 0 && end == slots {
            self.free(pb_blk)?;
        } else {
            self.pbc.set_item(self, pbc_entry, pbc_item, buf.as_slice())?;
        }
        Ok(count)
    }

    /// Read a piece of a sub-block. At most one sub-block's worth of
    /// bytes is returned; the caller loops across blocks.
    pub fn read_sb(&self, id: BlockId, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let (entry, item) = match id.decode()? {
            BlockAddr::Sb { entry, item } => (entry, item),
            _ => return Err(VmfsError::InvalidBlockId(id.raw())),
        };

        let data_size = self.sbc.header().data_size as usize;
        let offset = (pos % data_size as u64) as usize;
        let clen = (data_size - offset).min(buf.len());

        let mut tmp = AlignedBuf::for_dio(data_size)?;
        self.sbc.get_item(self, entry, item, tmp.as_mut_slice())?;
        buf[..clen].copy_from_slice(&tmp.as_slice()[offset..offset + clen]);
        Ok(clen)
    }

    /// Write a piece of a sub-block, read-modify-write unless the whole
    /// sub-block is overwritten. Returns the number of bytes consumed.
    pub fn write_sb(&self, id: BlockId, pos: u64, buf: &[u8]) -> Result<usize> {
        let (entry, item) = match id.decode()? {
            BlockAddr::Sb { entry, item } => (entry, item),
            _ => return Err(VmfsError::InvalidBlockId(id.raw())),
        };

        let data_size = self.sbc.header().data_size as usize;
        let offset = (pos % data_size as u64) as usize;
        let clen = (data_size - offset).min(buf.len());

        let mut tmp = AlignedBuf::for_dio(data_size)?;
        if !(offset == 0 && clen == data_size) {
            self.sbc.get_item(self, entry, item, tmp.as_mut_slice())?;
        }
        tmp.as_mut_slice()[offset..offset + clen].copy_from_slice(&buf[..clen]);
        self.sbc.set_item(self, entry, item, tmp.as_slice())?;
        Ok(clen)
    }

    /// Read a piece of a file block. Unaligned requests bounce through
    /// an aligned scratch buffer; aligned ones go straight to the
    /// caller's buffer. Returns the number of bytes read.
    pub fn read_fb(&self, id: BlockId, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let item = match id.decode()? {
            BlockAddr::Fb { item } => item,
            _ => return Err(VmfsError::InvalidBlockId(id.raw())),
        };

        let blk_size = self.blocksize();
        let offset = pos % blk_size;
        let clen = ((blk_size - offset) as usize).min(buf.len());
        if clen == 0 {
            return Ok(0);
        }

        let (n_offset, n_clen) = dio_window(offset, clen);

        if n_offset == offset && n_clen == clen && ptr_is_aligned(buf, M_DIO_BLK_SIZE) {
            self.read(item, n_offset, &mut buf[..n_clen])?;
            return Ok(clen);
        }

        let mut tmp = AlignedBuf::for_dio(n_clen)?;
        self.read(item, n_offset, tmp.as_mut_slice())?;
        let skip = (offset - n_offset) as usize;
        buf[..clen].copy_from_slice(&tmp.as_slice()[skip..skip + clen]);
        Ok(clen)
    }

    /// Write a piece of a file block, read-modify-write on the slow
    /// path. Returns the number of bytes consumed.
    pub fn write_fb(&self, id: BlockId, pos: u64, buf: &[u8]) -> Result<usize> {
        let item = match id.decode()? {
            BlockAddr::Fb { item } => item,
            _ => return Err(VmfsError::InvalidBlockId(id.raw())),
        };

        let blk_size = self.blocksize();
        let offset = pos % blk_size;
        let clen = ((blk_size - offset) as usize).min(buf.len());
        if clen == 0 {
            return Ok(0);
        }

        let (n_offset, n_clen) = dio_window(offset, clen);

        if n_offset == offset && n_clen == clen && ptr_is_aligned(buf, M_DIO_BLK_SIZE) {
            self.write(item, n_offset, &buf[..n_clen])?;
            return Ok(clen);
        }

        let mut tmp = AlignedBuf::for_dio(n_clen)?;
        self.read(item, n_offset, tmp.as_mut_slice())?;
        let skip = (offset - n_offset) as usize;
        tmp.as_mut_slice()[skip..skip + clen].copy_from_slice(&buf[..clen]);
        self.write(item, n_offset, tmp.as_slice())?;
        Ok(clen)
    }
}

/// Normalize an (offset, length) pair to the enclosing direct-I/O
/// window: an aligned start and a length covering the whole request.
fn dio_window(offset: u64, clen: usize) -> (u64, usize) {
    let dio = M_DIO_BLK_SIZE as u64;
    let n_offset = align_down(offset, dio);
    let n_clen = align_up(clen as u64 + (offset - n_offset), dio) as usize;
    (n_offset, n_clen)
}
