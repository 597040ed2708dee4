//! `voxel-streamer run` — boots the `tracing_subscriber::fmt()` logger and
//! serves until a `CancellationToken` trips on ctrl-c, for a clean
//! in-flight-request drain instead of an abrupt process kill.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::server::http;

pub async fn run_server(config_path: PathBuf) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_file(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(bind_addr = %settings.bind_addr, "starting voxel-streamer server");

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, shutting down");
        shutdown_for_signal.cancel();
    });

    http::serve(&settings, shutdown).await?;
    Ok(())
}
