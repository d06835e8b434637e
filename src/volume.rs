use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, VmfsError};
use crate::iobuf::AlignedBuf;

/// Physical offset of the volume header within an extent.
pub const VOLUME_HDR_OFFSET: u64 = 0x10_0000;
/// Physical offset where the extent's logical byte 0 lives.
pub const EXTENT_DATA_BASE: u64 = 0x100_0000;
/// On-disk size of the volume header record.
pub const VOLUME_HDR_SIZE: usize = 512;

const VOLUME_MAGIC: &[u8; 8] = b"VMFSVOL\0";
const VOLUME_VERSION: u32 = 1;

/// Metadata read from an extent's on-disk volume header.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeInfo {
    pub uuid: Uuid,
    pub lvm_uuid: Uuid,
    /// Total logical size of the whole volume set, in bytes.
    pub size: u64,
    /// Total number of filesystem blocks in the volume set.
    pub blocks: u64,
    pub num_extents: u32,
    pub first_segment: u32,
    pub last_segment: u32,
    pub num_segments: u32,
    pub ctime: i64,
}

impl VolumeInfo {
    /// Encode into a `VOLUME_HDR_SIZE` record with trailing CRC.
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= VOLUME_HDR_SIZE);
        buf[..VOLUME_HDR_SIZE].fill(0);
        buf[0..8].copy_from_slice(VOLUME_MAGIC);
        buf[8..12].copy_from_slice(&VOLUME_VERSION.to_le_bytes());
        buf[12..28].copy_from_slice(self.uuid.as_bytes());
        buf[28..44].copy_from_slice(self.lvm_uuid.as_bytes());
        buf[44..52].copy_from_slice(&self.size.to_le_bytes());
        buf[52..60].copy_from_slice(&self.blocks.to_le_bytes());
        buf[60..64].copy_from_slice(&self.num_extents.to_le_bytes());
        buf[64..68].copy_from_slice(&self.first_segment.to_le_bytes());
        buf[68..72].copy_from_slice(&self.last_segment.to_le_bytes());
        buf[72..76].copy_from_slice(&self.num_segments.to_le_bytes());
        buf[76..84].copy_from_slice(&self.ctime.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..84]);
        buf[84..88].copy_from_slice(&crc.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < VOLUME_HDR_SIZE {
            return Err(VmfsError::corrupt("volume header record truncated"));
        }
        if &buf[0..8] != VOLUME_MAGIC {
            return Err(VmfsError::corrupt("volume header magic mismatch"));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != VOLUME_VERSION {
            return Err(VmfsError::corrupt(format!(
                "unsupported volume header version {version}"
            )));
        }
        let stored_crc = u32::from_le_bytes(buf[84..88].try_into().unwrap());
        if crc32fast::hash(&buf[0..84]) != stored_crc {
            return Err(VmfsError::corrupt("volume header checksum mismatch"));
        }

        let info = VolumeInfo {
            uuid: Uuid::from_bytes(buf[12..28].try_into().unwrap()),
            lvm_uuid: Uuid::from_bytes(buf[28..44].try_into().unwrap()),
            size: u64::from_le_bytes(buf[44..52].try_into().unwrap()),
            blocks: u64::from_le_bytes(buf[52..60].try_into().unwrap()),
            num_extents: u32::from_le_bytes(buf[60..64].try_into().unwrap()),
            first_segment: u32::from_le_bytes(buf[64..68].try_into().unwrap()),
            last_segment: u32::from_le_bytes(buf[68..72].try_into().unwrap()),
            num_segments: u32::from_le_bytes(buf[72..76].try_into().unwrap()),
            ctime: i64::from_le_bytes(buf[76..84].try_into().unwrap()),
        };

        if info.num_segments == 0 || info.num_extents == 0 {
            return Err(VmfsError::corrupt("volume header declares an empty extent"));
        }
        if info.last_segment != info.first_segment + info.num_segments - 1 {
            return Err(VmfsError::corrupt(format!(
                "segment range [{}, {}] disagrees with num_segments {}",
                info.first_segment, info.last_segment, info.num_segments
            )));
        }
        Ok(info)
    }
}

/// One open physical extent backing part of a logical volume.
///
/// I/O always travels with an explicit offset (pread/pwrite); the volume
/// keeps no seek state and is safe to share between readers.
pub struct Volume {
    path: PathBuf,
    file: File,
    direct: bool,
    info: VolumeInfo,
}

impl Volume {
    /// Open the backing file or block device and read its header.
    ///
    /// Block devices are opened with O_DIRECT when the kernel allows it;
    /// regular files go through the page cache.
    pub fn open(path: &Path) -> Result<Volume> {
        let meta = std::fs::metadata(path)?;
        let is_blkdev = meta.file_type().is_block_device();

        let (file, direct) = if is_blkdev {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_DIRECT)
                .open(path)
            {
                Ok(f) => (f, true),
                Err(e) => {
                    log::warn!(
                        "O_DIRECT open failed for {}: {}. using buffered i/o",
                        path.display(),
                        e
                    );
                    (OpenOptions::new().read(true).write(true).open(path)?, false)
                }
            }
        } else {
            (OpenOptions::new().read(true).write(true).open(path)?, false)
        };

        let mut hdr = AlignedBuf::for_dio(VOLUME_HDR_SIZE)?;
        file.read_exact_at(hdr.as_mut_slice(), VOLUME_HDR_OFFSET)?;
        let info = VolumeInfo::decode(hdr.as_slice())?;

        if is_blkdev {
            let dev_size = block_device_size(path)?;
            let needed =
                EXTENT_DATA_BASE + info.num_segments as u64 * crate::lvm::SEGMENT_SIZE;
            if dev_size < needed {
                return Err(VmfsError::corrupt(format!(
                    "device {} is {dev_size} bytes, extent needs {needed}",
                    path.display()
                )));
            }
        }

        log::debug!(
            "opened extent {} (vol {}, segments {}..{})",
            path.display(),
            info.uuid,
            info.first_segment,
            info.last_segment
        );

        Ok(Volume {
            path: path.to_path_buf(),
            file,
            direct,
            info,
        })
    }

    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the backing store was opened with O_DIRECT.
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Read at a logical extent position. Short reads are errors.
    pub fn read(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, EXTENT_DATA_BASE + pos)?;
        Ok(())
    }

    /// Write at a logical extent position. Short writes are errors.
    pub fn write(&self, pos: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, EXTENT_DATA_BASE + pos)?;
        Ok(())
    }

    /// Take the whole-device reservation used to bracket metadata
    /// updates. Blocks until the current holder releases.
    ///
    /// On file-backed extents an exclusive flock stands in for the
    /// SCSI-2 reserve of the original protocol.
    pub fn reserve(&self) -> Result<()> {
        use nix::fcntl::{flock, FlockArg};
        flock(self.file.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|e| VmfsError::Io(std::io::Error::from(e)))?;
        Ok(())
    }

    /// Drop the whole-device reservation.
    pub fn release(&self) -> Result<()> {
        use nix::fcntl::{flock, FlockArg};
        flock(self.file.as_raw_fd(), FlockArg::Unlock)
            .map_err(|e| VmfsError::Io(std::io::Error::from(e)))?;
        Ok(())
    }

    /// Print volume information to stdout.
    pub fn show(&self) {
        println!("{self}");
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Extent {}:", self.path.display())?;
        writeln!(f, "  - UUID         : {}", self.info.uuid)?;
        writeln!(f, "  - LVM UUID     : {}", self.info.lvm_uuid)?;
        writeln!(
            f,
            "  - Segments     : {}..{} ({} total)",
            self.info.first_segment, self.info.last_segment, self.info.num_segments
        )?;
        write!(f, "  - Direct I/O   : {}", if self.direct { "yes" } else { "no" })
    }
}

/// Size of a block device in bytes via the BLKGETSIZE64 ioctl.
pub fn block_device_size(path: &Path) -> Result<u64> {
    let file = OpenOptions::new().read(true).open(path)?;
    let fd = file.as_raw_fd();

    let mut size: u64 = 0;
    const BLKGETSIZE64: libc::c_ulong = 0x80081272;
    let ret = unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, &mut size) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> VolumeInfo {
        VolumeInfo {
            uuid: Uuid::new_v4(),
            lvm_uuid: Uuid::new_v4(),
            size: 4 * 256 * 1024 * 1024,
            blocks: 1024,
            num_extents: 2,
            first_segment: 2,
            last_segment: 3,
            num_segments: 2,
            ctime: 1_700_000_000,
        }
    }

    #[test]
    fn header_round_trip() -> Result<()> {
        let info = sample_info();
        let mut buf = vec![0u8; VOLUME_HDR_SIZE];
        info.encode(&mut buf);
        let back = VolumeInfo::decode(&buf)?;
        assert_eq!(back.uuid, info.uuid);
        assert_eq!(back.lvm_uuid, info.lvm_uuid);
        assert_eq!(back.size, info.size);
        assert_eq!(back.blocks, info.blocks);
        assert_eq!(back.num_extents, info.num_extents);
        assert_eq!(back.first_segment, info.first_segment);
        assert_eq!(back.last_segment, info.last_segment);
        assert_eq!(back.num_segments, info.num_segments);
        Ok(())
    }

    #[test]
    fn header_rejects_corruption() {
        let info = sample_info();
        let mut buf = vec![0u8; VOLUME_HDR_SIZE];
        info.encode(&mut buf);

        let mut bad_magic = buf.clone();
        bad_magic[0] ^= 0xff;
        assert!(matches!(
            VolumeInfo::decode(&bad_magic),
            Err(VmfsError::Corrupt(_))
        ));

        let mut bad_body = buf.clone();
        bad_body[50] ^= 0x01;
        assert!(matches!(
            VolumeInfo::decode(&bad_body),
            Err(VmfsError::Corrupt(_))
        ));
    }

    #[test]
    fn header_rejects_bad_segment_range() {
        let mut info = sample_info();
        info.last_segment = 7;
        let mut buf = vec![0u8; VOLUME_HDR_SIZE];
        info.encode(&mut buf);
        assert!(matches!(
            VolumeInfo::decode(&buf),
            Err(VmfsError::Corrupt(_))
        ));
    }
}
