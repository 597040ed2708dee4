//! Configuration: a flat TOML file, one struct, sane defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Hard ceiling on parallel fetch lanes, never raised by config.
pub const MAX_LANES: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory under which preprocess-able files must live.
    pub data_root: PathBuf,
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Server-side task time-to-live, in seconds. Defaults to 10 minutes.
    pub task_ttl_secs: u64,
    /// Directory for the client's sled-backed caches.
    pub client_cache_dir: PathBuf,
    /// Default eviction max-age for the byte cache, in seconds. Defaults to
    /// 7 days.
    pub byte_cache_max_age_secs: u64,
    /// Number of parallel fetch lanes, clamped to `MAX_LANES`.
    pub max_lanes: usize,
    /// Backoff/retry policy for chunk fetches.
    pub retry: RetryConfig,
    /// Deadline for idle-time cache writeback, in milliseconds.
    pub idle_writeback_timeout_ms: u64,
    /// Whether a cache-only `loadData` re-validates against the server
    /// before trusting its local layout/byte caches.
    pub staleness_policy: StalenessPolicy,
}

/// How much `DataSource::load_data` trusts a `LayoutCache` hit.
///
/// `Trust` lets a cache hit short-circuit the network entirely. `Strict`
/// re-runs preprocess on every call and compares `file_size`/
/// `file_mtime_unix` against what's cached, invalidating both caches for
/// that file on a mismatch before serving from the (now fresh) cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StalenessPolicy {
    #[default]
    Trust,
    Strict,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:8080".to_string(),
            task_ttl_secs: 600,
            client_cache_dir: PathBuf::from("./voxel-cache"),
            byte_cache_max_age_secs: 7 * 24 * 3600,
            max_lanes: MAX_LANES,
            retry: RetryConfig::default(),
            idle_writeback_timeout_ms: 5_000,
            staleness_policy: StalenessPolicy::default(),
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let expanded = shellexpand::tilde(&raw).into_owned();
        let settings: Settings =
            toml::from_str(&expanded).context("failed to parse config file as TOML")?;
        Ok(settings)
    }

    pub fn write_default_config(path: &Path) -> Result<()> {
        let settings = Settings::default();
        let body = toml::to_string_pretty(&settings).context("failed to serialize default config")?;
        let body = format!(
            "# voxel-streamer configuration\n# generated by `voxel-streamer init`\n\n{body}"
        );
        std::fs::write(path, body)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn lanes(&self) -> usize {
        self.max_lanes.min(MAX_LANES).max(1)
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    pub fn byte_cache_max_age(&self) -> Duration {
        Duration::from_secs(self.byte_cache_max_age_secs)
    }
}

/// Chunk-fetch retry policy, configurable without changing the default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_attempts: 10,
        }
    }
}

impl RetryConfig {
    /// Delay before retry attempt `attempt` (0-indexed), computed before
    /// incrementing the counter, so attempt 0 waits `base_delay_ms`,
    /// attempt 1 waits `2 * base_delay_ms`, etc.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << attempt))
    }
}
