use anyhow::Result;
use clap::Parser;

mod cli;
mod client;
mod config;
mod error;
mod model;
mod server;
mod task;

#[cfg(feature = "failpoints")]
mod failpoints;

use cli::{CacheCommands, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Init { path } => {
            println!("Generating configuration file at: {}", path.display());
            config::Settings::write_default_config(&path)?;
            println!("Configuration file created successfully!");
            println!("Edit the file and run: voxel-streamer run -c {}", path.display());
        }
        Commands::Run { config } => {
            cli::run::run_server(config).await?;
        }
        Commands::Load {
            config,
            file,
            chunk_size,
            server_url,
        } => {
            cli::load::load(config, file, chunk_size, server_url).await?;
        }
        Commands::Cache { subcommand } => match subcommand {
            CacheCommands::Stats { config } => {
                cli::cache::stats(config).await?;
            }
            CacheCommands::Clear { config, file } => {
                cli::cache::clear(config, file).await?;
            }
            CacheCommands::ClearAll { config } => {
                cli::cache::clear_all(config).await?;
            }
        },
    }

    Ok(())
}
