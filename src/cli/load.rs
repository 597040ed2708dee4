//! `voxel-streamer load <file> <chunk_size>` — drives `DataSource::load_data`
//! against a running server and reports the result: load config, call one
//! collaborator, print a summary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use crate::client::data_source::DataSource;
use crate::client::perf_tracker::{PerformanceTracker, generate_session_id};
use crate::config::Settings;

pub async fn load(config_path: PathBuf, file: String, chunk_size: u64, server_url: String) -> Result<()> {
    let settings = Settings::from_file(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let data_source = DataSource::open(server_url, settings)
        .context("failed to open local caches")?;
    let tracker = PerformanceTracker::new(generate_session_id(), Arc::clone(data_source.perf_store()));

    let result = data_source
        .load_data(&file, chunk_size, Some(&tracker))
        .await
        .map_err(|e| anyhow!("loadData failed: {e}"))?;

    if let Err(e) = data_source.sync_performance(&tracker).await {
        tracing::warn!(error = %e, "failed to pull server-side performance records");
    }
    let session = tracker.complete();

    println!("file:            {file}");
    println!("chunk_size:      {chunk_size}");
    println!("shape:           ({}, {}, {})", result.shape.nx, result.shape.ny, result.shape.nz);
    println!("data_length:     {}", result.data_length);
    println!("bytes:           {}", result.bytes.len());
    match (result.global_min, result.global_max) {
        (Some(min), Some(max)) => println!("min/max:         {min} / {max}"),
        _ => println!("min/max:         (no data)"),
    }
    println!("task_id:         {}", result.task_id.as_deref().unwrap_or("(cache only)"));
    println!("fetch_ms:        {}", result.fetch_ms);
    println!("all_from_cache:  {}", result.all_from_cache);
    println!("session_id:      {}", tracker.session_id());
    println!(
        "trace:           {} record(s), {}ms-{}ms",
        session.records.len(),
        session.session_start_ms,
        session.session_end_ms
    );

    Ok(())
}
