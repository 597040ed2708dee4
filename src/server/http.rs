//! HTTP surface: `/voxel-grid/preprocess`, `/voxel-grid/chunk`,
//! `/performance`, plus the ambient `/health` and `/stats` endpoints.
//!
//! `AppState` holds shared handles; `CorsLayer::permissive()` and
//! `TraceLayer::new_for_http()` wrap the router, with graceful shutdown
//! via `CancellationToken`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Settings;
use crate::error::{ChunkError, PreprocessError};
use crate::model::{ChannelIndex, FileStatResponse, PerfRecord, PerformanceResponse, PreprocessResponse};
use crate::server::field_parser::RawGridParser;
use crate::server::perf_store::PerfStore;
use crate::server::preprocess::PreprocessService;
use crate::server::task_registry::{TakeResult, TaskRegistry};

#[derive(Default)]
struct Stats {
    preprocess_requests: AtomicU64,
    chunk_requests: AtomicU64,
    chunk_ready: AtomicU64,
    chunk_not_ready: AtomicU64,
    chunk_gone: AtomicU64,
    chunk_not_found: AtomicU64,
}

#[derive(Clone)]
pub struct AppState {
    preprocess: Arc<PreprocessService>,
    registry: Arc<TaskRegistry>,
    perf: Arc<PerfStore>,
    stats: Arc<Stats>,
}

impl AppState {
    pub fn new(settings: &Settings) -> Self {
        let registry = TaskRegistry::new();
        let preprocess = Arc::new(PreprocessService::new(
            settings.data_root.clone(),
            Arc::clone(&registry),
            Arc::new(RawGridParser),
            settings.task_ttl(),
        ));
        let perf = PerfStore::new(settings.task_ttl().max(std::time::Duration::from_secs(3600)));
        Self {
            preprocess,
            registry,
            perf,
            stats: Arc::new(Stats::default()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PreprocessRequest {
    file: String,
    chunk_size: u64,
    #[serde(default)]
    session_id: Option<String>,
}

async fn post_preprocess(
    State(state): State<AppState>,
    Json(req): Json<PreprocessRequest>,
) -> Result<Json<PreprocessResponse>, PreprocessError> {
    state.stats.preprocess_requests.fetch_add(1, Ordering::Relaxed);
    let start_ms = now_ms();
    let response = state.preprocess.preprocess(&req.file, req.chunk_size).await?;
    if let Some(session_id) = &req.session_id {
        state
            .perf
            .append(
                session_id,
                vec![PerfRecord {
                    start_ms,
                    end_ms: now_ms(),
                    channel_group: "server".to_string(),
                    channel_index: ChannelIndex::Str("preprocess".to_string()),
                    msg: req.file.clone(),
                }],
            )
            .await;
    }
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct StatQuery {
    file: String,
}

async fn get_stat(
    State(state): State<AppState>,
    Query(q): Query<StatQuery>,
) -> Result<Json<FileStatResponse>, PreprocessError> {
    let (file_size, file_mtime_unix) = state.preprocess.stat(&q.file).await?;
    Ok(Json(FileStatResponse {
        file_size,
        file_mtime_unix,
    }))
}

#[derive(Debug, Deserialize)]
struct ChunkQuery {
    task_id: String,
    chunk_index: u32,
    #[serde(default)]
    session_id: Option<String>,
}

async fn get_chunk(State(state): State<AppState>, Query(q): Query<ChunkQuery>) -> Response {
    state.stats.chunk_requests.fetch_add(1, Ordering::Relaxed);
    let start_ms = now_ms();

    #[cfg(feature = "failpoints")]
    {
        fail::fail_point!(crate::failpoints::CHUNK_ALWAYS_NOT_READY, |_| {
            state.stats.chunk_not_ready.fetch_add(1, Ordering::Relaxed);
            StatusCode::ACCEPTED.into_response()
        });
        fail::fail_point!(crate::failpoints::TASK_ALWAYS_EXPIRED, |_| {
            state.stats.chunk_not_found.fetch_add(1, Ordering::Relaxed);
            ChunkError::NotFound.into_response()
        });
    }

    let (response, outcome) = match state.registry.take_chunk(&q.task_id, q.chunk_index as usize).await {
        TakeResult::Ready(bytes) => {
            state.stats.chunk_ready.fetch_add(1, Ordering::Relaxed);
            (
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/octet-stream")],
                    bytes,
                )
                    .into_response(),
                "ready",
            )
        }
        TakeResult::NotReady => {
            state.stats.chunk_not_ready.fetch_add(1, Ordering::Relaxed);
            (StatusCode::ACCEPTED.into_response(), "not_ready")
        }
        TakeResult::AlreadyConsumed => {
            state.stats.chunk_gone.fetch_add(1, Ordering::Relaxed);
            (ChunkError::AlreadyConsumed.into_response(), "gone")
        }
        TakeResult::NotFound => {
            state.stats.chunk_not_found.fetch_add(1, Ordering::Relaxed);
            (ChunkError::NotFound.into_response(), "not_found")
        }
        TakeResult::ParseFailed(message) => (ChunkError::ParseFailed(message).into_response(), "parse_failed"),
    };

    if let Some(session_id) = &q.session_id {
        state
            .perf
            .append(
                session_id,
                vec![PerfRecord {
                    start_ms,
                    end_ms: now_ms(),
                    channel_group: "server".to_string(),
                    channel_index: ChannelIndex::Int(q.chunk_index as i64),
                    msg: format!("chunk {} {outcome}", q.chunk_index),
                }],
            )
            .await;
    }

    response
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Deserialize)]
struct PerfQuery {
    session_id: String,
}

async fn get_performance(State(state): State<AppState>, Query(q): Query<PerfQuery>) -> Json<PerformanceResponse> {
    let records = state
        .perf
        .records_for(&q.session_id)
        .await
        .iter()
        .map(Into::into)
        .collect();
    Json(PerformanceResponse {
        session_id: q.session_id,
        records,
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    preprocess_requests: u64,
    chunk_requests: u64,
    chunk_ready: u64,
    chunk_not_ready: u64,
    chunk_gone: u64,
    chunk_not_found: u64,
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        preprocess_requests: state.stats.preprocess_requests.load(Ordering::Relaxed),
        chunk_requests: state.stats.chunk_requests.load(Ordering::Relaxed),
        chunk_ready: state.stats.chunk_ready.load(Ordering::Relaxed),
        chunk_not_ready: state.stats.chunk_not_ready.load(Ordering::Relaxed),
        chunk_gone: state.stats.chunk_gone.load(Ordering::Relaxed),
        chunk_not_found: state.stats.chunk_not_found.load(Ordering::Relaxed),
    })
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(get_stats))
        .route("/voxel-grid/preprocess", post(post_preprocess))
        .route("/voxel-grid/stat", get(get_stat))
        .route("/voxel-grid/chunk", get(get_chunk))
        .route("/performance", get(get_performance))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves the router, shutting down gracefully when `shutdown`
/// is cancelled.
pub async fn serve(
    settings: &Settings,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .map_err(|e| std::io::Error::other(format!("invalid bind_addr {}: {e}", settings.bind_addr)))?;
    let state = AppState::new(settings);
    let router = create_router(state);

    info!("starting voxel-grid HTTP server on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await?;
    info!("voxel-grid HTTP server shut down on {addr}");
    Ok(())
}
