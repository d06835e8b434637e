pub mod bitmap;
pub mod block;
pub mod error;
pub mod format;
pub mod fs;
pub mod iobuf;
pub mod lvm;
pub mod metadata;
pub mod volume;

pub use bitmap::{Bitmap, BitmapEntry, BitmapHeader, BlockStatus};
pub use block::{BlockAddr, BlockId, BlockType};
pub use error::{Result, VmfsError};
pub use format::{format_volume, FormatOptions};
pub use fs::{Filesystem, FsInfo};
pub use lvm::{Lvm, LvmInfo, SEGMENT_SIZE};
pub use metadata::{metadata_lock, metadata_unlock, MetadataHeader};
pub use volume::{Volume, VolumeInfo};
