//! CLI argument definitions for upkg

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use upkg::Codec;

#[derive(Parser, Debug)]
#[command(name = "upkg")]
#[command(about = "Inspect and unpack Unreal Engine 1-3 packages")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (default: ~/.config/upkg/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Extra directory searched for imported packages (can specify multiple)
    #[arg(short = 'p', long = "search-path", global = true)]
    pub search_paths: Vec<PathBuf>,

    /// Force a codec for compressed data: store, zlib, lzo, lzx, lz4, oodle
    #[arg(long, global = true)]
    pub codec: Option<Codec>,

    /// YAML quirk table consulted before the builtin rules
    #[arg(long, global = true)]
    pub quirks: Option<PathBuf>,

    /// Decompress chunks on demand instead of eagerly in parallel
    #[arg(long, global = true)]
    pub lazy: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show package summaries
    #[command(visible_alias = "i")]
    Info {
        /// Package files
        #[arg(required = true)]
        packages: Vec<PathBuf>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the name table
    Names {
        package: PathBuf,
    },

    /// List the import table with resolved paths
    Imports {
        package: PathBuf,
    },

    /// List the export table with classes and serial windows
    Exports {
        package: PathBuf,
    },

    /// List exports of every package under the given files or directories
    #[command(visible_alias = "ls")]
    List {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Resolve objects and print their tagged properties as JSON
    Dump {
        package: PathBuf,

        /// Only this object (case-insensitive name)
        #[arg(short, long)]
        object: Option<String>,
    },

    /// Write an uncompressed copy of a package
    Unpack {
        package: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
}
