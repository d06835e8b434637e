use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vmfsio")]
#[command(about = "VMFS volume access tool", long_about = None)]
pub struct Cli {
    /// Output results in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a fresh volume set on the given extents
    Format {
        /// Extent files or block devices, in order
        #[arg(required = true)]
        extents: Vec<PathBuf>,

        /// Segments per extent (256 MiB each)
        #[arg(long, default_value_t = 1)]
        segments: u32,

        /// File block size in bytes
        #[arg(long, default_value_t = 1024 * 1024)]
        block_size: u64,

        /// Sub-block size in bytes
        #[arg(long, default_value_t = 4096)]
        sub_block_size: u32,

        /// Volume label
        #[arg(long, default_value = "")]
        label: String,
    },

    /// Show volume set and filesystem information
    Info {
        /// Extent files or block devices, in order
        #[arg(required = true)]
        extents: Vec<PathBuf>,
    },

    /// Report whether a block is allocated or free
    Status {
        /// Extent files or block devices, in order
        #[arg(required = true)]
        extents: Vec<PathBuf>,

        /// Block ID (decimal or 0x-prefixed hex)
        #[arg(long)]
        block: String,
    },

    /// Allocate one block of the given kind and print its ID
    Alloc {
        /// Extent files or block devices, in order
        #[arg(required = true)]
        extents: Vec<PathBuf>,

        /// Block kind
        #[arg(long, value_enum)]
        kind: BlockKind,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BlockKind {
    Fb,
    Sb,
    Pb,
    Fd,
}
