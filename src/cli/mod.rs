//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- start the gateway server
//! - `pack` -- build a `.vkp` package from a plugin binary and metadata
//! - `version` -- print build/version info

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::vkp::{self, PluginMetadata};

/// vkgate gateway server.
#[derive(Parser, Debug)]
#[command(
    name = "vkgate",
    version = env!("CARGO_PKG_VERSION"),
    about = "vkgate — modular API gateway with runtime VKP plugins"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Start,

    /// Build a .vkp package from a plugin binary and its metadata file.
    Pack {
        /// Path to the plugin executable.
        binary: PathBuf,

        /// Path to the plugin.json metadata file.
        #[arg(short, long)]
        metadata: PathBuf,

        /// Output .vkp path.
        #[arg(short, long)]
        output: PathBuf,

        /// Extra resource files to include (stored under their basenames).
        #[arg(long = "include")]
        include: Vec<PathBuf>,
    },

    /// Print version information.
    Version,
}

/// Handle `vkgate pack`.
pub fn handle_pack(
    binary: &PathBuf,
    metadata_path: &PathBuf,
    output: &PathBuf,
    include: &[PathBuf],
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read(metadata_path)?;
    let metadata: PluginMetadata = serde_json::from_slice(&raw)?;
    metadata.validate()?;

    vkp::write_package(output, binary, &metadata, include)?;
    println!(
        "packed {} v{} -> {}",
        metadata.name,
        metadata.version,
        output.display()
    );
    Ok(())
}

/// Handle `vkgate version`.
pub fn handle_version() {
    println!("vkgate {}", env!("CARGO_PKG_VERSION"));
}
