//! `voxel-streamer cache stats|clear|clear-all` — inspecting and clearing
//! the client's local caches.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::client::data_source::DataSource;
use crate::config::Settings;

pub async fn stats(config_path: PathBuf) -> Result<()> {
    let settings = Settings::from_file(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let data_source = DataSource::open("http://127.0.0.1:0", settings)
        .context("failed to open local caches")?;

    println!("byte cache entries:   {}", data_source.byte_cache().len());
    println!("layout cache entries: {}", data_source.layout_cache().len());
    Ok(())
}

pub async fn clear(config_path: PathBuf, file: String) -> Result<()> {
    let settings = Settings::from_file(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let data_source = DataSource::open("http://127.0.0.1:0", settings)
        .context("failed to open local caches")?;

    let removed = data_source.byte_cache().delete_by_file(&file);
    data_source.layout_cache().delete_by_file(&file);
    println!("removed {removed} cached chunk(s) for {file}");
    Ok(())
}

pub async fn clear_all(config_path: PathBuf) -> Result<()> {
    let settings = Settings::from_file(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let data_source = DataSource::open("http://127.0.0.1:0", settings)
        .context("failed to open local caches")?;

    data_source.byte_cache().clear_all();
    data_source.layout_cache().clear_all();
    println!("all local caches cleared");
    Ok(())
}
