//! `ChunkFetchWorker` — one lane per fetch request stream.
//!
//! A `tokio::task` actor owns an `mpsc::Receiver<LaneRequest>` and replies
//! via a `oneshot::Sender` carried in the request — ownership of the
//! `Vec<u8>` moves into the reply exactly once. The retry shape (try, log
//! a `warn!` on failure, back off) runs the exact 100·2^k ms, 10-attempt
//! schedule a 202 response demands.

use std::sync::Arc;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::LoadError;

/// One chunk-fetch request handed to a lane.
pub struct LaneRequest {
    pub task_id: String,
    pub chunk_index: u32,
    pub session_id: Option<String>,
    pub reply: oneshot::Sender<LaneReply>,
}

/// The lane's reply: either the transferred bytes plus local min/max, or
/// an error.
pub enum LaneReply {
    Chunk { bytes: Vec<u8>, min: f64, max: f64 },
    Error(LoadError),
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// Handle to a spawned lane: a sender for requests plus the task handle so
/// callers can `terminate()` it — there is no other cancellation channel.
pub struct LaneHandle {
    tx: mpsc::Sender<LaneRequest>,
    task: tokio::task::JoinHandle<()>,
}

impl LaneHandle {
    /// A clonable sender into this lane's mailbox, so several in-flight
    /// requests can be dispatched to the same lane concurrently (DataSource
    /// assigns misses to lanes round-robin).
    pub fn sender(&self) -> mpsc::Sender<LaneRequest> {
        self.tx.clone()
    }

    /// Terminates all spawned lane workers. Dropping the sender ends the
    /// lane's receive loop; `abort` is the hard-stop for a lane that is
    /// mid-retry-sleep.
    pub fn terminate(self) {
        drop(self.tx);
        self.task.abort();
    }
}

/// Dispatches one request to a lane via its sender and awaits the reply
/// (free function so callers can clone a `mpsc::Sender` into an owned
/// future without borrowing the `LaneHandle` itself).
pub async fn dispatch(
    tx: mpsc::Sender<LaneRequest>,
    task_id: String,
    chunk_index: u32,
    session_id: Option<String>,
) -> LaneReply {
    let (reply_tx, reply_rx) = oneshot::channel();
    if tx
        .send(LaneRequest {
            task_id,
            chunk_index,
            session_id,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return LaneReply::Error(LoadError::Transport {
            chunk_index,
            message: "lane worker has already terminated".to_string(),
        });
    }
    match reply_rx.await {
        Ok(reply) => reply,
        Err(_) => LaneReply::Error(LoadError::Transport {
            chunk_index,
            message: "lane worker dropped the reply channel".to_string(),
        }),
    }
}

/// Spawns one lane, running on its own dedicated background task.
/// `lane_index` is only used for log correlation.
pub fn spawn_lane(
    lane_index: usize,
    client: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
) -> LaneHandle {
    let (tx, mut rx) = mpsc::channel::<LaneRequest>(8);
    let task = crate::task::spawn_named("voxel-chunk-fetch-lane", async move {
        debug!(lane_index, "fetch lane started");
        while let Some(req) = rx.recv().await {
            let reply = fetch_chunk_with_retry(&client, &base_url, &retry, &req).await;
            let _ = req.reply.send(reply);
        }
        debug!(lane_index, "fetch lane shut down");
    });
    LaneHandle { tx, task }
}

/// The 202-retry state machine. Delay is computed before incrementing the
/// attempt counter so the sequence is exactly 100, 200, 400, ... ms,
/// capped at `retry.max_attempts`.
async fn fetch_chunk_with_retry(
    client: &reqwest::Client,
    base_url: &str,
    retry: &RetryConfig,
    req: &LaneRequest,
) -> LaneReply {
    let url = format!("{base_url}/voxel-grid/chunk");
    let chunk_index_str = req.chunk_index.to_string();
    let mut attempt = 0u32;
    loop {
        let mut query = vec![
            ("task_id", req.task_id.as_str()),
            ("chunk_index", chunk_index_str.as_str()),
        ];
        if let Some(session_id) = &req.session_id {
            query.push(("session_id", session_id.as_str()));
        }
        let response = client.get(&url).query(&query).send().await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return LaneReply::Error(LoadError::Transport {
                    chunk_index: req.chunk_index,
                    message: e.to_string(),
                });
            }
        };

        match response.status() {
            StatusCode::OK => {
                let bytes = match response.bytes().await {
                    Ok(b) => b.to_vec(),
                    Err(e) => {
                        return LaneReply::Error(LoadError::Transport {
                            chunk_index: req.chunk_index,
                            message: e.to_string(),
                        });
                    }
                };
                return match min_max(&bytes) {
                    Some((min, max)) => LaneReply::Chunk { bytes, min, max },
                    None => LaneReply::Error(LoadError::Transport {
                        chunk_index: req.chunk_index,
                        message: "chunk has zero length, min/max undefined".to_string(),
                    }),
                };
            }
            StatusCode::ACCEPTED => {
                if attempt >= retry.max_attempts {
                    return LaneReply::Error(LoadError::ChunkTimeout {
                        chunk_index: req.chunk_index,
                        attempts: retry.max_attempts,
                    });
                }
                let delay = retry.delay_for_attempt(attempt);
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            StatusCode::NOT_FOUND => {
                return LaneReply::Error(LoadError::TaskExpired {
                    chunk_index: req.chunk_index,
                });
            }
            StatusCode::BAD_REQUEST => {
                return LaneReply::Error(LoadError::ChunkGone {
                    chunk_index: req.chunk_index,
                });
            }
            status => {
                let body = response.json::<ErrorBody>().await.ok();
                let message = body
                    .map(|b| {
                        if b.message.is_empty() {
                            b.error
                        } else {
                            b.message
                        }
                    })
                    .unwrap_or_else(|| format!("unexpected status {status}"));
                warn!(chunk_index = req.chunk_index, %status, message, "unexpected chunk response");
                return LaneReply::Error(LoadError::Transport {
                    chunk_index: req.chunk_index,
                    message,
                });
            }
        }
    }
}

/// Single-pass min/max over the chunk reinterpreted as `f64[]`. `None` for
/// a zero-length chunk.
fn min_max(bytes: &[u8]) -> Option<(f64, f64)> {
    if bytes.is_empty() || bytes.len() % 8 != 0 {
        return None;
    }
    let mut chunks = bytes.chunks_exact(8);
    let first = f64::from_le_bytes(chunks.next()?.try_into().unwrap());
    let mut min = first;
    let mut max = first;
    for c in chunks {
        let v = f64::from_le_bytes(c.try_into().unwrap());
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    Some((min, max))
}

/// Builds the shared `reqwest::Client` used by every lane. Lanes share no
/// mutable memory, but a pooled HTTP client is safe to clone — it's
/// `Arc`-backed internally.
pub fn build_http_client() -> Arc<reqwest::Client> {
    Arc::new(reqwest::Client::new())
}
