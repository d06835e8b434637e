use uuid::Uuid;

use crate::error::{Result, VmfsError};
use crate::fs::Filesystem;
use crate::iobuf::AlignedBuf;

/// On-disk size of a metadata header record.
pub const METADATA_HDR_SIZE: usize = 512;

const MDH_MAGIC: &[u8; 8] = b"VMFSMDH\0";

pub const LOCK_FREE: u32 = 0;
pub const LOCK_EXCLUSIVE: u32 = 1;

/// The lock record stored at the front of every bitmap entry.
///
/// The on-disk copy is the single source of truth; in-memory copies are
/// snapshots that become stale the moment another host takes the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHeader {
    /// Logical position of the record itself.
    pub pos: u64,
    /// Generation counter, bumped on every locked update.
    pub gen: u64,
    pub lock_state: u32,
    /// Host currently holding the lock, if any.
    pub owner: Option<Uuid>,
    /// Number of times the lock has been taken.
    pub lock_counter: u64,
    pub mtime: i64,
}

impl MetadataHeader {
    pub fn new(pos: u64, mtime: i64) -> Self {
        MetadataHeader {
            pos,
            gen: 0,
            lock_state: LOCK_FREE,
            owner: None,
            lock_counter: 0,
            mtime,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_state != LOCK_FREE
    }

    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= METADATA_HDR_SIZE);
        buf[..METADATA_HDR_SIZE].fill(0);
        buf[0..8].copy_from_slice(MDH_MAGIC);
        buf[8..16].copy_from_slice(&self.pos.to_le_bytes());
        buf[16..24].copy_from_slice(&self.gen.to_le_bytes());
        buf[24..28].copy_from_slice(&self.lock_state.to_le_bytes());
        buf[28..44].copy_from_slice(self.owner.unwrap_or_else(Uuid::nil).as_bytes());
        buf[44..52].copy_from_slice(&self.lock_counter.to_le_bytes());
        buf[52..60].copy_from_slice(&self.mtime.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..60]);
        buf[60..64].copy_from_slice(&crc.to_le_bytes());
    }

    /// Decode a record read from `expected_pos`, validating magic, CRC
    /// and the self-position field.
    pub fn decode(buf: &[u8], expected_pos: u64) -> Result<Self> {
        if buf.len() < METADATA_HDR_SIZE {
            return Err(VmfsError::corrupt("metadata header record truncated"));
        }
        if &buf[0..8] != MDH_MAGIC {
            return Err(VmfsError::corrupt(format!(
                "metadata header magic mismatch at {expected_pos:#x}"
            )));
        }
        let stored_crc = u32::from_le_bytes(buf[60..64].try_into().unwrap());
        if crc32fast::hash(&buf[0..60]) != stored_crc {
            return Err(VmfsError::corrupt(format!(
                "metadata header checksum mismatch at {expected_pos:#x}"
            )));
        }
        let pos = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        if pos != expected_pos {
            return Err(VmfsError::corrupt(format!(
                "metadata header at {expected_pos:#x} claims position {pos:#x}"
            )));
        }
        let owner = Uuid::from_bytes(buf[28..44].try_into().unwrap());
        Ok(MetadataHeader {
            pos,
            gen: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            lock_state: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            owner: if owner.is_nil() { None } else { Some(owner) },
            lock_counter: u64::from_le_bytes(buf[44..52].try_into().unwrap()),
            mtime: i64::from_le_bytes(buf[52..60].try_into().unwrap()),
        })
    }
}

/// Acquire exclusive access to the metadata record at `mdh.pos`.
///
/// The backing extent is reserved for the duration of the
/// read-check-write and released on every path. A record held by
/// another host fails with `LockContended`; one held by this host is
/// re-acquired. On success `mdh` reflects the locked on-disk state.
///
/// Callers hold at most one metadata lock at a time and release it at
/// the end of the current critical section.
pub fn metadata_lock(fs: &Filesystem, mdh: &mut MetadataHeader) -> Result<()> {
    let pos = mdh.pos;
    fs.lvm().reserve(pos)?;
    let res = lock_reserved(fs, mdh);
    finish_reserved(fs, pos, res)
}

fn lock_reserved(fs: &Filesystem, mdh: &mut MetadataHeader) -> Result<()> {
    let pos = mdh.pos;
    let mut buf = AlignedBuf::for_dio(METADATA_HDR_SIZE)?;
    fs.read_at(pos, buf.as_mut_slice())?;
    let on_disk = MetadataHeader::decode(buf.as_slice(), pos)?;

    if on_disk.is_locked() && on_disk.owner != Some(fs.host_uuid()) {
        log::debug!(
            "metadata lock at {pos:#x} held by {}",
            on_disk.owner.map(|u| u.to_string()).unwrap_or_default()
        );
        return Err(VmfsError::LockContended);
    }

    let mut updated = on_disk;
    updated.lock_state = LOCK_EXCLUSIVE;
    updated.owner = Some(fs.host_uuid());
    updated.gen += 1;
    updated.lock_counter += 1;
    updated.mtime = chrono::Utc::now().timestamp();
    updated.encode(buf.as_mut_slice());
    fs.write_at(pos, buf.as_slice())?;

    *mdh = updated;
    Ok(())
}

/// Release the metadata lock held in `mdh`, clearing owner and state.
pub fn metadata_unlock(fs: &Filesystem, mdh: &mut MetadataHeader) -> Result<()> {
    let pos = mdh.pos;
    fs.lvm().reserve(pos)?;
    let res = unlock_reserved(fs, mdh);
    finish_reserved(fs, pos, res)
}

fn unlock_reserved(fs: &Filesystem, mdh: &mut MetadataHeader) -> Result<()> {
    let mut updated = *mdh;
    updated.lock_state = LOCK_FREE;
    updated.owner = None;
    updated.gen += 1;
    updated.mtime = chrono::Utc::now().timestamp();

    let mut buf = AlignedBuf::for_dio(METADATA_HDR_SIZE)?;
    updated.encode(buf.as_mut_slice());
    fs.write_at(updated.pos, buf.as_slice())?;

    *mdh = updated;
    Ok(())
}

fn finish_reserved(fs: &Filesystem, pos: u64, res: Result<()>) -> Result<()> {
    match fs.lvm().release(pos) {
        Ok(()) => res,
        Err(e) => {
            log::warn!("failed to release reservation at {pos:#x}: {e}");
            res.and(Err(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() -> Result<()> {
        let hdr = MetadataHeader {
            pos: 0x42_0000,
            gen: 9,
            lock_state: LOCK_EXCLUSIVE,
            owner: Some(Uuid::new_v4()),
            lock_counter: 5,
            mtime: 1_700_000_000,
        };
        let mut buf = vec![0u8; METADATA_HDR_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(MetadataHeader::decode(&buf, 0x42_0000)?, hdr);
        Ok(())
    }

    #[test]
    fn nil_owner_decodes_as_none() -> Result<()> {
        let hdr = MetadataHeader::new(0x1000, 0);
        let mut buf = vec![0u8; METADATA_HDR_SIZE];
        hdr.encode(&mut buf);
        let back = MetadataHeader::decode(&buf, 0x1000)?;
        assert_eq!(back.owner, None);
        assert!(!back.is_locked());
        Ok(())
    }

    #[test]
    fn position_mismatch_is_corrupt() {
        let hdr = MetadataHeader::new(0x1000, 0);
        let mut buf = vec![0u8; METADATA_HDR_SIZE];
        hdr.encode(&mut buf);
        assert!(matches!(
            MetadataHeader::decode(&buf, 0x2000),
            Err(VmfsError::Corrupt(_))
        ));
    }
}
