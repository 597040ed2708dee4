//! CLI surface: one `#[derive(Parser)]` struct, subcommands grouped by
//! concern, a thin `parse_args()` wrapper.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod cache;
pub mod load;
pub mod run;

#[derive(Parser)]
#[command(name = "voxel-streamer")]
#[command(author, version, about = "Chunked, cached, parallel loader for large voxel grids", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a default configuration file
    Init {
        #[arg(default_value = "voxel-streamer.toml")]
        path: PathBuf,
    },
    /// Run the preprocess/chunk/performance HTTP server
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Load a voxel grid through the client pipeline and report the result
    Load {
        #[arg(short, long)]
        config: PathBuf,
        /// File name, relative to the server's configured data root
        file: String,
        /// Chunk size in elements
        chunk_size: u64,
        /// Base URL of a running server, e.g. http://127.0.0.1:8080
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server_url: String,
    },
    /// Inspect or clear the client's local caches
    Cache {
        #[command(subcommand)]
        subcommand: CacheCommands,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Print byte-cache and layout-cache entry counts
    Stats {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Remove every cached chunk and layout record for one file
    Clear {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        file: String,
    },
    /// Remove every cache entry (byte cache, layout cache, perf sessions)
    ClearAll {
        #[arg(short, long)]
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
