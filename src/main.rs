mod cli;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use cli::{BlockKind, Cli, Commands};
use vmfsio::{format_volume, BlockId, BlockType, Filesystem, FormatOptions, Lvm};

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let json_output = cli.json;

    match cli.command {
        Commands::Format {
            extents,
            segments,
            block_size,
            sub_block_size,
            label,
        } => cmd_format(&extents, segments, block_size, sub_block_size, label, json_output),
        Commands::Info { extents } => cmd_info(&extents, json_output),
        Commands::Status { extents, block } => cmd_status(&extents, &block, json_output),
        Commands::Alloc { extents, kind } => cmd_alloc(&extents, kind, json_output),
    }
}

fn open_lvm(extents: &[PathBuf]) -> Result<Lvm> {
    let mut lvm = Lvm::new();
    for path in extents {
        lvm.add_extent(path)
            .with_context(|| format!("Unable to add extent {}", path.display()))?;
    }
    Ok(lvm)
}

fn open_fs(extents: &[PathBuf]) -> Result<Filesystem> {
    Filesystem::open(open_lvm(extents)?).context("Unable to open filesystem")
}

fn cmd_format(
    extents: &[PathBuf],
    segments: u32,
    block_size: u64,
    sub_block_size: u32,
    label: String,
    json_output: bool,
) -> Result<()> {
    let opts = FormatOptions {
        label,
        segments_per_extent: segments,
        block_size,
        sub_block_size,
        ..FormatOptions::default()
    };
    let info = format_volume(extents, &opts).context("Format failed")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!(
            "Formatted volume set {} ({} blocks of {} bytes)",
            info.uuid, info.total_blocks, info.block_size
        );
    }
    Ok(())
}

fn cmd_info(extents: &[PathBuf], json_output: bool) -> Result<()> {
    let fs = open_fs(extents)?;

    if json_output {
        #[derive(Serialize)]
        struct InfoReport<'a> {
            lvm: &'a vmfsio::LvmInfo,
            fs: &'a vmfsio::FsInfo,
        }
        let report = InfoReport {
            lvm: fs.lvm().info().expect("open filesystem has extents"),
            fs: fs.info(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        fs.lvm().show();
        let info = fs.info();
        println!();
        println!("Filesystem Information:");
        println!("  - UUID       : {}", info.uuid);
        println!("  - Label      : {}", info.label);
        println!("  - Block size : {}", info.block_size);
        println!("  - Blocks     : {}", info.total_blocks);
    }
    Ok(())
}

fn cmd_status(extents: &[PathBuf], block: &str, json_output: bool) -> Result<()> {
    let id: BlockId = block
        .parse()
        .with_context(|| format!("Bad block id '{block}'"))?;
    let fs = open_fs(extents)?;
    let status = fs.get_status(id)?;

    if json_output {
        println!(
            "{}",
            serde_json::json!({ "block": id.to_string(), "status": status.to_string() })
        );
    } else {
        println!("{id}: {status}");
    }
    Ok(())
}

fn cmd_alloc(extents: &[PathBuf], kind: BlockKind, json_output: bool) -> Result<()> {
    let ty = match kind {
        BlockKind::Fb => BlockType::Fb,
        BlockKind::Sb => BlockType::Sb,
        BlockKind::Pb => BlockType::Pb,
        BlockKind::Fd => BlockType::Fd,
    };
    let fs = open_fs(extents)?;
    let id = fs.alloc(ty)?;

    if json_output {
        println!("{}", serde_json::json!({ "block": id.to_string() }));
    } else {
        println!("{id}");
    }
    Ok(())
}
