use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmfsError>;

/// Errors surfaced by the volume, bitmap and block layers.
#[derive(Debug, Error)]
pub enum VmfsError {
    /// Block ID carries an unknown type discriminator.
    #[error("invalid block id {0:#010x}")]
    InvalidBlockId(u32),

    /// Logical position falls outside every loaded extent.
    #[error("no extent covers logical position {0:#x}")]
    NoExtent(u64),

    /// Requested range would cross an extent boundary.
    #[error("i/o of {len} bytes at {pos:#x} spans an extent boundary")]
    SpansExtents { pos: u64, len: usize },

    /// Extent header disagrees with the volume set already loaded.
    #[error("extent {0} is not part of this volume set")]
    MismatchedExtent(String),

    /// Volume set opened before all extents were added.
    #[error("volume set incomplete: {loaded} of {expected} extents loaded")]
    MissingExtents { loaded: usize, expected: u32 },

    /// Metadata lock is held by another host.
    #[error("metadata lock held by another host")]
    LockContended,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Bitmap has no free item of the requested kind.
    #[error("no free item of the requested kind")]
    NoSpace,

    /// An on-disk invariant does not hold.
    #[error("on-disk corruption: {0}")]
    Corrupt(String),
}

impl VmfsError {
    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        VmfsError::Corrupt(detail.into())
    }
}
