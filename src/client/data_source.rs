//! `DataSource` — the client orchestrator.
//!
//! `futures::stream::FuturesUnordered` drives the chunk fetches
//! concurrently; a `CancellationToken` per load cancels outstanding awaits
//! as soon as a single chunk errors, instead of waiting out every lane.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::byte_cache::{self, LocalByteCache};
use crate::client::fetch_worker::{self, LaneReply};
use crate::client::layout_cache::LayoutCache;
use crate::client::perf_tracker::{PerfStoreClient, PerformanceTracker};
use crate::config::{Settings, StalenessPolicy};
use crate::error::LoadError;
use crate::model::{
    ChunkDescriptor, FileStatResponse, LayoutRecord, LoadResult, LocalCachedChunk, PreprocessResponse, Shape,
};

struct ChunkOutcome {
    bytes: Vec<u8>,
    min: f64,
    max: f64,
    from_cache: bool,
}

struct WritebackJob {
    file: String,
    chunk_size: u64,
    chunk_index: u32,
    bytes: Vec<u8>,
    min: f64,
    max: f64,
    timestamp_ms: i64,
}

/// The client-side orchestrator implementing `loadData`.
pub struct DataSource {
    http: reqwest::Client,
    base_url: String,
    layout_cache: Arc<LayoutCache>,
    byte_cache: Arc<LocalByteCache>,
    perf_store: Arc<PerfStoreClient>,
    settings: Settings,
    writeback_tx: mpsc::UnboundedSender<WritebackJob>,
}

impl DataSource {
    pub fn open(base_url: impl Into<String>, settings: Settings) -> sled::Result<Arc<Self>> {
        std::fs::create_dir_all(&settings.client_cache_dir).ok();
        let db = byte_cache::open_db(&settings.client_cache_dir)?;
        let layout_cache = LayoutCache::open(&db)?;
        let byte_cache_store = LocalByteCache::open(&db)?;
        let perf_store = PerfStoreClient::open(&db)?;

        byte_cache::spawn_eviction_loop(
            Arc::clone(&byte_cache_store),
            settings.byte_cache_max_age(),
            Duration::from_secs(3600),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        spawn_writeback_drain(
            Arc::clone(&byte_cache_store),
            rx,
            Duration::from_millis(settings.idle_writeback_timeout_ms),
        );

        Ok(Arc::new(Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            layout_cache,
            byte_cache: byte_cache_store,
            perf_store,
            settings,
            writeback_tx: tx,
        }))
    }

    pub fn byte_cache(&self) -> &Arc<LocalByteCache> {
        &self.byte_cache
    }

    pub fn layout_cache(&self) -> &Arc<LayoutCache> {
        &self.layout_cache
    }

    /// Shared with every lane task via `Arc` clone, so a tracker created on
    /// the main thread can still be reached from worker lanes.
    pub fn perf_store(&self) -> &Arc<PerfStoreClient> {
        &self.perf_store
    }

    /// `loadData(file, chunkSize, tracker?) -> LoadResult`.
    ///
    /// When `tracker` is given, its `session_id` also rides along on every
    /// preprocess/chunk request, since both endpoints accept an optional
    /// `session_id`, so server-side trace records land in the same session
    /// and `GET /performance` has something to union in.
    pub async fn load_data(
        &self,
        file: &str,
        chunk_size: u64,
        tracker: Option<&PerformanceTracker>,
    ) -> Result<LoadResult, LoadError> {
        if chunk_size == 0 {
            return Err(LoadError::Validation("chunk_size must be >= 1".into()));
        }
        let load_started = Instant::now();
        if let Some(t) = tracker {
            t.start_event(
                format!("load:{file}:{chunk_size}"),
                "data-source",
                file.to_string(),
                "loadData",
            );
        }
        let session_id = tracker.map(|t| t.session_id().to_string());
        let result = self
            .load_data_inner(file, chunk_size, session_id.as_deref(), load_started)
            .await;
        if let Some(t) = tracker {
            t.end_event(&format!("load:{file}:{chunk_size}"));
        }
        result
    }

    /// Pulls this session's server-recorded trace records via
    /// `GET /performance` and unions them into the tracker's local session
    /// envelope. Server records are pulled on demand rather than pushed,
    /// so a caller that never asks for them pays no extra round trip.
    pub async fn sync_performance(&self, tracker: &PerformanceTracker) -> Result<(), LoadError> {
        let url = format!("{}/performance", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("session_id", tracker.session_id())])
            .send()
            .await
            .map_err(|e| LoadError::Server(e.to_string()))?;
        let body: crate::model::PerformanceResponse = response
            .json()
            .await
            .map_err(|e| LoadError::Server(format!("malformed performance response: {e}")))?;
        tracker.merge_server_records(body.records.into_iter().map(Into::into).collect());
        Ok(())
    }

    async fn load_data_inner(
        &self,
        file: &str,
        chunk_size: u64,
        session_id: Option<&str>,
        load_started: Instant,
    ) -> Result<LoadResult, LoadError> {
        // Step 1-2: layout hit + all-cached short-circuit.
        if let Some(layout) = self.layout_cache.get(file, chunk_size)
            && let Some(outcomes) = self.try_all_cached(file, chunk_size, &layout.chunks)
        {
            if self.settings.staleness_policy == StalenessPolicy::Strict {
                match self.revalidate(file, chunk_size, session_id, &layout).await {
                    Ok(None) => {}
                    Ok(Some(fresh)) => {
                        info!(file, chunk_size, "cached layout stale under strict policy, refetching");
                        return self
                            .load_data_from_response(file, chunk_size, session_id, fresh, load_started)
                            .await;
                    }
                    Err(e) => {
                        warn!(file, error = %e, "strict revalidation failed, falling back to network");
                        return self
                            .load_data_inner_uncached(file, chunk_size, session_id, load_started)
                            .await;
                    }
                }
            }
            info!(file, chunk_size, "loadData served entirely from local caches");
            check_merge_size(layout.data_length, &outcomes)?;
            return Ok(self.assemble(
                file,
                chunk_size,
                layout.shape,
                layout.data_length,
                outcomes,
                None,
                true,
                load_started,
            ));
        }

        self.load_data_inner_uncached(file, chunk_size, session_id, load_started).await
    }

    /// `StalenessPolicy::Strict`: a cheap `GET /voxel-grid/stat` compares the
    /// file's identity against the cached `LayoutRecord` before a full
    /// preprocess is paid for. Returns `Ok(None)` when the cache is still
    /// good, `Ok(Some(response))` with a fresh preprocess result when it
    /// wasn't (both caches for `file` are evicted in that case, so the
    /// caller's retry goes fully to the network).
    async fn revalidate(
        &self,
        file: &str,
        chunk_size: u64,
        session_id: Option<&str>,
        layout: &LayoutRecord,
    ) -> Result<Option<PreprocessResponse>, LoadError> {
        let stat = self.stat(file).await?;
        if stat.file_size == layout.file_size && stat.file_mtime_unix == layout.file_mtime_unix {
            return Ok(None);
        }
        self.byte_cache.delete_by_file(file);
        self.layout_cache.delete_by_file(file);
        Ok(Some(self.preprocess(file, chunk_size, session_id).await?))
    }

    async fn stat(&self, file: &str) -> Result<FileStatResponse, LoadError> {
        let url = format!("{}/voxel-grid/stat", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("file", file)])
            .send()
            .await
            .map_err(|e| LoadError::Server(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LoadError::Server(format!("stat failed ({status}): {body}")));
        }
        response
            .json::<FileStatResponse>()
            .await
            .map_err(|e| LoadError::Server(format!("malformed stat response: {e}")))
    }

    async fn load_data_inner_uncached(
        &self,
        file: &str,
        chunk_size: u64,
        session_id: Option<&str>,
        load_started: Instant,
    ) -> Result<LoadResult, LoadError> {
        // Preprocess covers both "no layout" and "partial cache miss".
        let response = self.preprocess(file, chunk_size, session_id).await?;
        self.load_data_from_response(file, chunk_size, session_id, response, load_started)
            .await
    }

    async fn load_data_from_response(
        &self,
        file: &str,
        chunk_size: u64,
        session_id: Option<&str>,
        response: PreprocessResponse,
        load_started: Instant,
    ) -> Result<LoadResult, LoadError> {
        self.layout_cache.put(
            file,
            chunk_size,
            &LayoutRecord {
                shape: response.shape,
                chunks: response.chunks.clone(),
                data_length: response.data_length,
                chunk_size: response.chunk_size,
                file_size: response.file_size,
                file_mtime_unix: response.file_mtime_unix,
            },
        );

        if response.chunks.is_empty() {
            // Empty field: nothing to fetch or merge.
            return Ok(LoadResult {
                bytes: Vec::new(),
                shape: response.shape,
                data_length: 0,
                global_min: None,
                global_max: None,
                task_id: Some(response.task_id),
                fetch_ms: load_started.elapsed().as_millis() as u64,
                all_from_cache: false,
            });
        }

        let outcomes = self
            .fetch_chunks(file, chunk_size, &response.task_id, session_id, &response.chunks)
            .await?;
        check_merge_size(response.data_length, &outcomes)?;

        Ok(self.assemble(
            file,
            chunk_size,
            response.shape,
            response.data_length,
            outcomes,
            Some(response.task_id),
            false,
            load_started,
        ))
    }

    /// If every chunk in `chunks` hits the byte cache, returns the ordered
    /// outcomes; otherwise `None`, so a later per-chunk miss falls through
    /// to preprocess rather than returning a partial result.
    fn try_all_cached(
        &self,
        file: &str,
        chunk_size: u64,
        chunks: &[ChunkDescriptor],
    ) -> Option<Vec<ChunkOutcome>> {
        let mut outcomes = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let cached = self.byte_cache.get(file, chunk_size, chunk.index)?;
            outcomes.push(ChunkOutcome {
                bytes: cached.bytes,
                min: cached.min,
                max: cached.max,
                from_cache: true,
            });
        }
        Some(outcomes)
    }

    async fn preprocess(
        &self,
        file: &str,
        chunk_size: u64,
        session_id: Option<&str>,
    ) -> Result<PreprocessResponse, LoadError> {
        let url = format!("{}/voxel-grid/preprocess", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "file": file,
                "chunk_size": chunk_size,
                "session_id": session_id,
            }))
            .send()
            .await
            .map_err(|e| LoadError::Server(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LoadError::Server(format!("preprocess failed ({status}): {body}")));
        }
        response
            .json::<PreprocessResponse>()
            .await
            .map_err(|e| LoadError::Server(format!("malformed preprocess response: {e}")))
    }

    /// Fans out cache misses across lanes, awaits completion, and cancels
    /// outstanding work on the first error.
    async fn fetch_chunks(
        &self,
        file: &str,
        chunk_size: u64,
        task_id: &str,
        session_id: Option<&str>,
        chunks: &[ChunkDescriptor],
    ) -> Result<Vec<ChunkOutcome>, LoadError> {
        let mut outcomes: Vec<Option<ChunkOutcome>> = (0..chunks.len()).map(|_| None).collect();
        let mut misses: Vec<&ChunkDescriptor> = Vec::new();
        for chunk in chunks {
            match self.byte_cache.get(file, chunk_size, chunk.index) {
                Some(cached) => {
                    outcomes[chunk.index as usize] = Some(ChunkOutcome {
                        bytes: cached.bytes,
                        min: cached.min,
                        max: cached.max,
                        from_cache: true,
                    });
                }
                None => misses.push(chunk),
            }
        }

        if misses.is_empty() {
            return Ok(outcomes.into_iter().map(|o| o.unwrap()).collect());
        }

        let lane_count = self.settings.lanes().min(misses.len());
        let lanes: Vec<_> = (0..lane_count)
            .map(|i| {
                fetch_worker::spawn_lane(
                    i,
                    self.http.clone(),
                    self.base_url.clone(),
                    self.settings.retry,
                )
            })
            .collect();
        let senders: Vec<_> = lanes.iter().map(|l| l.sender()).collect();

        let cancel = CancellationToken::new();
        let mut pending = FuturesUnordered::new();
        for (miss_index, chunk) in misses.iter().enumerate() {
            let lane = miss_index % lane_count;
            let tx = senders[lane].clone();
            let task_id = task_id.to_string();
            let chunk_index = chunk.index;
            let session_id = session_id.map(|s| s.to_string());
            let cancel = cancel.clone();
            pending.push(async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(LoadError::Transport {
                        chunk_index,
                        message: "load cancelled after an earlier chunk failed".to_string(),
                    }),
                    reply = fetch_worker::dispatch(tx, task_id, chunk_index, session_id) => match reply {
                        LaneReply::Chunk { bytes, min, max } => Ok((chunk_index, bytes, min, max)),
                        LaneReply::Error(e) => Err(e),
                    },
                }
            });
        }

        let mut first_error: Option<LoadError> = None;
        while let Some(result) = pending.next().await {
            match result {
                Ok((index, bytes, min, max)) => {
                    outcomes[index as usize] = Some(ChunkOutcome {
                        bytes,
                        min,
                        max,
                        from_cache: false,
                    });
                }
                Err(e) => {
                    if first_error.is_none() {
                        warn!(error = %e, "chunk fetch failed, cancelling remaining awaits");
                        cancel.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }

        for lane in lanes {
            lane.terminate();
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(outcomes
            .into_iter()
            .enumerate()
            .map(|(i, o)| {
                o.unwrap_or_else(|| panic!("chunk {i} neither cached nor fetched nor errored"))
            })
            .collect())
    }

    /// Steps 6-9: sort (already index-ordered here), concatenate, compute
    /// global min/max, schedule idle writeback, return the result.
    fn assemble(
        &self,
        file: &str,
        chunk_size: u64,
        shape: Shape,
        data_length: u64,
        outcomes: Vec<ChunkOutcome>,
        task_id: Option<String>,
        all_from_cache: bool,
        load_started: Instant,
    ) -> LoadResult {
        let mut bytes = Vec::with_capacity((data_length * 8) as usize);
        let mut global_min = f64::INFINITY;
        let mut global_max = f64::NEG_INFINITY;
        let now_ms = chrono::Utc::now().timestamp_millis();

        for (index, outcome) in outcomes.into_iter().enumerate() {
            if outcome.min < global_min {
                global_min = outcome.min;
            }
            if outcome.max > global_max {
                global_max = outcome.max;
            }
            // Idle-time writeback, network-sourced chunks only — a cache
            // hit is already durable.
            if !outcome.from_cache {
                let job = WritebackJob {
                    file: file.to_string(),
                    chunk_size,
                    chunk_index: index as u32,
                    bytes: outcome.bytes.clone(),
                    min: outcome.min,
                    max: outcome.max,
                    timestamp_ms: now_ms,
                };
                if self.writeback_tx.send(job).is_err() {
                    warn!("writeback queue closed, dropping cache write");
                }
            }
            bytes.extend_from_slice(&outcome.bytes);
        }

        LoadResult {
            bytes,
            shape,
            data_length,
            global_min: Some(global_min),
            global_max: Some(global_max),
            task_id,
            fetch_ms: load_started.elapsed().as_millis() as u64,
            all_from_cache,
        }
    }
}

/// Integrity check: the sum of chunk element counts must equal
/// `dataLength`.
fn check_merge_size(data_length: u64, outcomes: &[ChunkOutcome]) -> Result<(), LoadError> {
    let expected = data_length * 8;
    let actual: u64 = outcomes.iter().map(|o| o.bytes.len() as u64).sum();
    if actual != expected {
        return Err(LoadError::MergeSizeMismatch { expected, actual });
    }
    Ok(())
}

fn spawn_writeback_drain(
    cache: Arc<LocalByteCache>,
    mut rx: mpsc::UnboundedReceiver<WritebackJob>,
    deadline: Duration,
) -> tokio::task::JoinHandle<()> {
    crate::task::spawn_named("voxel-data-source-writeback", async move {
        loop {
            match tokio::time::timeout(deadline, rx.recv()).await {
                Ok(Some(job)) => {
                    cache.put(
                        &job.file,
                        job.chunk_size,
                        job.chunk_index,
                        &LocalCachedChunk {
                            bytes: job.bytes,
                            min: job.min,
                            max: job.max,
                            timestamp_ms: job.timestamp_ms,
                        },
                    );
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
    })
}
