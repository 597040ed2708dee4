//! `LocalByteCache` — persistent key-value store for chunk payloads.
//!
//! A primary tree holding the payload, a secondary tree emulating an
//! index on `file` (sled has no real secondary indexes), and a background
//! prune loop spawned from the constructor. Values are `bincode`-encoded.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::model::LocalCachedChunk;

/// Primary key shape `"${file}_${chunkSize}_${chunkIndex}"`, rendered with
/// NUL separators so prefix scans (by `file`) can't collide with a file
/// name that happens to contain an underscore.
fn primary_key(file: &str, chunk_size: u64, chunk_index: u32) -> Vec<u8> {
    format!("{file}\0{chunk_size}\0{chunk_index}").into_bytes()
}

/// A persistent byte cache mapping `(file, chunkSize, chunkIndex)` to the
/// chunk's bytes plus its local min/max.
///
/// `get` is pure; `put` is idempotent; writes never block a load — callers
/// route `put` through the idle-writeback queue in `data_source`, this
/// type itself is a plain synchronous store.
pub struct LocalByteCache {
    chunks: sled::Tree,
    by_file: sled::Tree,
}

impl LocalByteCache {
    pub fn open(db: &sled::Db) -> sled::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            chunks: db.open_tree("chunks")?,
            by_file: db.open_tree("chunks_by_file")?,
        }))
    }

    pub fn get(&self, file: &str, chunk_size: u64, chunk_index: u32) -> Option<LocalCachedChunk> {
        match self.chunks.get(primary_key(file, chunk_size, chunk_index)) {
            Ok(Some(raw)) => bincode::deserialize(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, file, chunk_index, "byte cache read failed, treating as miss");
                None
            }
        }
    }

    pub fn put(
        &self,
        file: &str,
        chunk_size: u64,
        chunk_index: u32,
        chunk: &LocalCachedChunk,
    ) {
        let Ok(encoded) = bincode::serialize(chunk) else {
            warn!(file, chunk_index, "failed to encode cached chunk, dropping write");
            return;
        };
        let key = primary_key(file, chunk_size, chunk_index);
        if let Err(e) = self.chunks.insert(&key, encoded) {
            warn!(error = %e, file, chunk_index, "byte cache write failed");
            return;
        }
        if let Err(e) = self.by_file.insert(&key, &[]) {
            warn!(error = %e, file, "byte cache file-index write failed");
        }
    }

    /// Bulk erase via the `file` secondary index.
    pub fn delete_by_file(&self, file: &str) -> usize {
        let prefix = format!("{file}\0").into_bytes();
        let mut removed = 0usize;
        for entry in self.by_file.scan_prefix(&prefix) {
            let Ok((key, _)) = entry else { continue };
            let _ = self.chunks.remove(&key);
            let _ = self.by_file.remove(&key);
            removed += 1;
        }
        removed
    }

    /// Bulk erase of entries older than `max_age`. Sled has no numeric
    /// secondary index, so this scans the (local, small) primary tree and
    /// filters on the decoded timestamp.
    pub fn evict(&self, now_ms: i64, max_age: Duration) -> usize {
        let cutoff = now_ms - max_age.as_millis() as i64;
        let mut stale_keys = Vec::new();
        for entry in self.chunks.iter() {
            let Ok((key, raw)) = entry else { continue };
            if let Ok(cached) = bincode::deserialize::<LocalCachedChunk>(&raw)
                && cached.timestamp_ms < cutoff
            {
                stale_keys.push(key);
            }
        }
        let removed = stale_keys.len();
        for key in stale_keys {
            let _ = self.chunks.remove(&key);
            let _ = self.by_file.remove(&key);
        }
        removed
    }

    pub fn clear_all(&self) {
        let _ = self.chunks.clear();
        let _ = self.by_file.clear();
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Spawns the background eviction loop from its own constructor, the way
/// a self-pruning cache manages its own lifecycle.
pub fn spawn_eviction_loop(
    cache: Arc<LocalByteCache>,
    max_age: Duration,
    sweep_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    crate::task::spawn_named("voxel-byte-cache-evict", async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let now_ms = chrono::Utc::now().timestamp_millis();
            let removed = cache.evict(now_ms, max_age);
            if removed > 0 {
                tracing::debug!(removed, "byte cache eviction swept stale chunks");
            }
        }
    })
}

pub fn open_db(dir: &Path) -> sled::Result<sled::Db> {
    sled::open(dir)
}
