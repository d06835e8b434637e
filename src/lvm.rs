use std::fmt;
use std::path::Path;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, VmfsError};
use crate::volume::Volume;

/// Granularity at which logical positions are mapped to extents.
/// Segments locate extents; they are not a unit of allocation.
pub const SEGMENT_SIZE: u64 = 256 * 1024 * 1024;

/// Identity and sizing shared by every extent of one volume set,
/// seeded from the first extent added.
#[derive(Debug, Clone, Serialize)]
pub struct LvmInfo {
    pub uuid: Uuid,
    pub size: u64,
    pub blocks: u64,
    pub num_extents: u32,
}

/// Logical volume manager: stitches extents into one linear address
/// space. I/O never spans extents; the caller splits ranges first.
pub struct Lvm {
    info: Option<LvmInfo>,
    extents: Vec<Volume>,
}

impl Lvm {
    pub fn new() -> Self {
        Lvm {
            info: None,
            extents: Vec::new(),
        }
    }

    /// Shared volume-set identity, once at least one extent is loaded.
    pub fn info(&self) -> Option<&LvmInfo> {
        self.info.as_ref()
    }

    pub fn loaded_extents(&self) -> usize {
        self.extents.len()
    }

    pub fn extents(&self) -> &[Volume] {
        &self.extents
    }

    /// Open an extent and append it to the set.
    ///
    /// The first extent seeds the set identity; later extents must carry
    /// the same LVM UUID and sizing or the set is left unchanged.
    pub fn add_extent(&mut self, path: &Path) -> Result<()> {
        let vol = Volume::open(path)?;
        let vi = vol.info();

        match &self.info {
            None => {
                self.info = Some(LvmInfo {
                    uuid: vi.lvm_uuid,
                    size: vi.size,
                    blocks: vi.blocks,
                    num_extents: vi.num_extents,
                });
            }
            Some(info) => {
                if info.uuid != vi.lvm_uuid {
                    log::error!(
                        "{} belongs to volume set {}, not {}",
                        path.display(),
                        vi.lvm_uuid,
                        info.uuid
                    );
                    return Err(VmfsError::MismatchedExtent(path.display().to_string()));
                }
                if info.size != vi.size
                    || info.blocks != vi.blocks
                    || info.num_extents != vi.num_extents
                {
                    log::error!("volume set information mismatch for {}", path.display());
                    return Err(VmfsError::MismatchedExtent(path.display().to_string()));
                }
            }
        }

        self.extents.push(vol);
        Ok(())
    }

    /// Check that every extent of the set has been added.
    pub fn open(&self) -> Result<()> {
        let expected = self.info.as_ref().map(|i| i.num_extents).unwrap_or(0);
        if self.extents.len() != expected as usize || expected == 0 {
            return Err(VmfsError::MissingExtents {
                loaded: self.extents.len(),
                expected,
            });
        }
        Ok(())
    }

    fn extent_for(&self, pos: u64) -> Result<&Volume> {
        let segment = pos / SEGMENT_SIZE;
        for vol in &self.extents {
            let vi = vol.info();
            if segment >= vi.first_segment as u64 && segment <= vi.last_segment as u64 {
                return Ok(vol);
            }
        }
        Err(VmfsError::NoExtent(pos))
    }

    /// Map a logical range to (extent, local position), rejecting ranges
    /// that would cross the extent's end.
    fn locate(&self, pos: u64, len: usize) -> Result<(&Volume, u64)> {
        let vol = self.extent_for(pos)?;
        let vi = vol.info();
        let local = pos - vi.first_segment as u64 * SEGMENT_SIZE;
        let extent_size = vi.num_segments as u64 * SEGMENT_SIZE;
        if local + len as u64 > extent_size {
            log::error!("i/o spanning several extents is unsupported");
            return Err(VmfsError::SpansExtents { pos, len });
        }
        Ok((vol, local))
    }

    /// Read a raw range of the logical volume.
    pub fn read(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let (vol, local) = self.locate(pos, buf.len())?;
        vol.read(local, buf)
    }

    /// Write a raw range of the logical volume.
    pub fn write(&self, pos: u64, buf: &[u8]) -> Result<()> {
        let (vol, local) = self.locate(pos, buf.len())?;
        vol.write(local, buf)
    }

    /// Reserve the extent backing a logical position.
    pub fn reserve(&self, pos: u64) -> Result<()> {
        self.extent_for(pos)?.reserve()
    }

    /// Release the extent backing a logical position.
    pub fn release(&self, pos: u64) -> Result<()> {
        self.extent_for(pos)?.release()
    }

    /// Print volume set information to stdout.
    pub fn show(&self) {
        println!("{self}");
        for vol in &self.extents {
            vol.show();
        }
    }
}

impl Default for Lvm {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Lvm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Logical Volume Information:")?;
        match &self.info {
            Some(info) => {
                writeln!(f, "  - UUID         : {}", info.uuid)?;
                writeln!(f, "  - Size         : {} GiB", info.size / (1024 * 1024 * 1024))?;
                writeln!(f, "  - Blocks       : {}", info.blocks)?;
                write!(f, "  - Num. Extents : {}", info.num_extents)
            }
            None => write!(f, "  (no extents loaded)"),
        }
    }
}
