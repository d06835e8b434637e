use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::bitmap::Bitmap;
use crate::error::{Result, VmfsError};
use crate::iobuf::{AlignedBuf, M_DIO_BLK_SIZE};
use crate::lvm::{Lvm, SEGMENT_SIZE};

/// On-disk size of the filesystem header record.
pub const FS_HDR_SIZE: usize = 512;
/// Logical offset of the filesystem header.
pub const FS_INFO_OFFSET: u64 = 0;

const FS_MAGIC: &[u8; 8] = b"VMFSFS\0\0";
const FS_VERSION: u32 = 1;
const FS_LABEL_LEN: usize = 32;

/// Filesystem header: identity, block geometry and where the four
/// bitmap regions live on the logical volume.
#[derive(Debug, Clone, Serialize)]
pub struct FsInfo {
    pub uuid: Uuid,
    pub label: String,
    pub block_size: u64,
    pub total_blocks: u64,
    pub fbb_base: u64,
    pub sbc_base: u64,
    pub pbc_base: u64,
    pub fdc_base: u64,
}

impl FsInfo {
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= FS_HDR_SIZE);
        buf[..FS_HDR_SIZE].fill(0);
        buf[0..8].copy_from_slice(FS_MAGIC);
        buf[8..12].copy_from_slice(&FS_VERSION.to_le_bytes());
        buf[12..28].copy_from_slice(self.uuid.as_bytes());
        let label = self.label.as_bytes();
        let n = label.len().min(FS_LABEL_LEN);
        buf[28..28 + n].copy_from_slice(&label[..n]);
        buf[60..68].copy_from_slice(&self.block_size.to_le_bytes());
        buf[68..76].copy_from_slice(&self.total_blocks.to_le_bytes());
        buf[76..84].copy_from_slice(&self.fbb_base.to_le_bytes());
        buf[84..92].copy_from_slice(&self.sbc_base.to_le_bytes());
        buf[92..100].copy_from_slice(&self.pbc_base.to_le_bytes());
        buf[100..108].copy_from_slice(&self.fdc_base.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..108]);
        buf[108..112].copy_from_slice(&crc.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FS_HDR_SIZE {
            return Err(VmfsError::corrupt("filesystem header record truncated"));
        }
        if &buf[0..8] != FS_MAGIC {
            return Err(VmfsError::corrupt("filesystem header magic mismatch"));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != FS_VERSION {
            return Err(VmfsError::corrupt(format!(
                "unsupported filesystem version {version}"
            )));
        }
        let stored_crc = u32::from_le_bytes(buf[108..112].try_into().unwrap());
        if crc32fast::hash(&buf[0..108]) != stored_crc {
            return Err(VmfsError::corrupt("filesystem header checksum mismatch"));
        }

        let label_raw = &buf[28..28 + FS_LABEL_LEN];
        let label_end = label_raw.iter().position(|&b| b == 0).unwrap_or(FS_LABEL_LEN);
        let info = FsInfo {
            uuid: Uuid::from_bytes(buf[12..28].try_into().unwrap()),
            label: String::from_utf8_lossy(&label_raw[..label_end]).into_owned(),
            block_size: u64::from_le_bytes(buf[60..68].try_into().unwrap()),
            total_blocks: u64::from_le_bytes(buf[68..76].try_into().unwrap()),
            fbb_base: u64::from_le_bytes(buf[76..84].try_into().unwrap()),
            sbc_base: u64::from_le_bytes(buf[84..92].try_into().unwrap()),
            pbc_base: u64::from_le_bytes(buf[92..100].try_into().unwrap()),
            fdc_base: u64::from_le_bytes(buf[100..108].try_into().unwrap()),
        };

        let bs = info.block_size;
        if bs == 0 || bs % M_DIO_BLK_SIZE as u64 != 0 || SEGMENT_SIZE % bs != 0 {
            return Err(VmfsError::corrupt(format!("bad block size {bs}")));
        }
        if info.total_blocks == 0 {
            return Err(VmfsError::corrupt("filesystem declares zero blocks"));
        }
        Ok(info)
    }
}

/// A mounted filesystem: the logical volume plus the four bitmap
/// allocators discovered from the filesystem header.
///
/// Bitmap operations receive this handle explicitly; bitmaps keep no
/// back-pointer to the filesystem.
pub struct Filesystem {
    lvm: Arc<Lvm>,
    info: FsInfo,
    /// Identity this mount uses as metadata lock owner.
    host_uuid: Uuid,
    pub fbb: Bitmap,
    pub sbc: Bitmap,
    pub pbc: Bitmap,
    pub fdc: Bitmap,
}

impl Filesystem {
    /// Mount a fully loaded logical volume.
    pub fn open(lvm: Lvm) -> Result<Filesystem> {
        lvm.open()?;

        let mut buf = AlignedBuf::for_dio(FS_HDR_SIZE)?;
        lvm.read(FS_INFO_OFFSET, buf.as_mut_slice())?;
        let info = FsInfo::decode(buf.as_slice())?;

        let fbb = Bitmap::open(&lvm, "fbb", info.fbb_base)?;
        let sbc = Bitmap::open(&lvm, "sbc", info.sbc_base)?;
        let pbc = Bitmap::open(&lvm, "pbc", info.pbc_base)?;
        let fdc = Bitmap::open(&lvm, "fdc", info.fdc_base)?;

        if fbb.header().total_items as u64 != info.total_blocks {
            return Err(VmfsError::corrupt(format!(
                "file block bitmap covers {} blocks, header declares {}",
                fbb.header().total_items,
                info.total_blocks
            )));
        }

        let host_uuid = Uuid::new_v4();
        log::info!(
            "mounted filesystem {} ({:?}), host id {host_uuid}",
            info.uuid,
            info.label
        );

        Ok(Filesystem {
            lvm: Arc::new(lvm),
            info,
            host_uuid,
            fbb,
            sbc,
            pbc,
            fdc,
        })
    }

    pub fn info(&self) -> &FsInfo {
        &self.info
    }

    pub fn lvm(&self) -> &Lvm {
        &self.lvm
    }

    /// Lock-owner identity of this mount.
    pub fn host_uuid(&self) -> Uuid {
        self.host_uuid
    }

    /// Filesystem block size from the on-disk header.
    pub fn blocksize(&self) -> u64 {
        self.info.block_size
    }

    /// Read within the file block `item`, `pos` bytes into it.
    pub fn read(&self, item: u32, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.lvm.read(item as u64 * self.info.block_size + pos, buf)
    }

    /// Write within the file block `item`, `pos` bytes into it.
    pub fn write(&self, item: u32, pos: u64, buf: &[u8]) -> Result<()> {
        self.lvm.write(item as u64 * self.info.block_size + pos, buf)
    }

    /// Raw read at a logical volume offset (bitmap and lock records).
    pub(crate) fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.lvm.read(pos, buf)
    }

    /// Raw write at a logical volume offset (bitmap and lock records).
    pub(crate) fn write_at(&self, pos: u64, buf: &[u8]) -> Result<()> {
        self.lvm.write(pos, buf)
    }
}
