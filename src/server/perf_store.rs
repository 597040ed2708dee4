//! `PerfStore` — session-keyed append log of tracing records, the
//! server-side half of the performance-tracing substrate.
//!
//! A `DashMap`-backed cache with a background TTL sweep; the "value" is
//! an append-only `Vec` of records instead of a single cached item, since
//! multiple writers (one per in-flight request) can converge on the same
//! session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::debug;

use crate::model::PerfRecord;

struct SessionEntry {
    records: Mutex<Vec<PerfRecord>>,
    last_touched: Mutex<Instant>,
}

/// In-memory append log, keyed by `session_id`.
pub struct PerfStore {
    sessions: DashMap<String, Arc<SessionEntry>>,
    max_age: Duration,
}

impl PerfStore {
    pub fn new(max_age: Duration) -> Arc<Self> {
        let store = Arc::new(Self {
            sessions: DashMap::new(),
            max_age,
        });
        let store_clone = Arc::clone(&store);
        tokio::spawn(async move {
            store_clone.background_sweep_task().await;
        });
        store
    }

    /// Appends `records` to `session_id`'s log, creating the session if
    /// this is its first writer.
    pub async fn append(&self, session_id: &str, mut records: Vec<PerfRecord>) {
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionEntry {
                    records: Mutex::new(Vec::new()),
                    last_touched: Mutex::new(Instant::now()),
                })
            })
            .clone();
        entry.records.lock().await.append(&mut records);
        *entry.last_touched.lock().await = Instant::now();
    }

    /// Returns a copy of every record recorded so far for `session_id`
    /// (empty if the session has never been written to).
    pub async fn records_for(&self, session_id: &str) -> Vec<PerfRecord> {
        match self.sessions.get(session_id) {
            Some(entry) => entry.records.lock().await.clone(),
            None => Vec::new(),
        }
    }

    async fn background_sweep_task(&self) {
        let mut ticker = interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            self.sweep(Instant::now()).await;
        }
    }

    async fn sweep(&self, now: Instant) {
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            if now.duration_since(*entry.last_touched.lock().await) > self.max_age {
                expired.push(entry.key().clone());
            }
        }
        for session_id in expired {
            self.sessions.remove(&session_id);
            debug!(session_id, "performance session expired and dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelIndex;

    fn record(start_ms: i64, end_ms: i64) -> PerfRecord {
        PerfRecord {
            start_ms,
            end_ms,
            channel_group: "net".into(),
            channel_index: ChannelIndex::Int(0),
            msg: "fetch".into(),
        }
    }

    #[tokio::test]
    async fn append_then_read_back_unions() {
        let store = PerfStore::new(Duration::from_secs(600));
        store.append("s1", vec![record(0, 10)]).await;
        store.append("s1", vec![record(10, 30)]).await;
        let records = store.records_for("s1").await;
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn unknown_session_returns_empty() {
        let store = PerfStore::new(Duration::from_secs(600));
        assert!(store.records_for("nope").await.is_empty());
    }
}
