//! `PerformanceTracker` + `PerfStoreClient` — session-scoped, multi-writer
//! tracing substrate.
//!
//! Writers union their records, sort, and recompute the session envelope
//! rather than relying on write ordering, backed by a `sled::Tree` so the
//! session is durable and reachable from both the main task and every
//! fetch lane via one shared `Arc` — sled serializes concurrent writes
//! from multiple threads for free.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::model::{ChannelIndex, PerfRecord, PerfSession};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A fresh opaque session id, produced on tracker creation, same
/// random-hex shape as `server::task_registry::generate_task_id`.
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Durable, concurrently-writable session log, keyed by `session_id`.
pub struct PerfStoreClient {
    tree: sled::Tree,
}

impl PerfStoreClient {
    pub fn open(db: &sled::Db) -> sled::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            tree: db.open_tree("performance-sessions")?,
        }))
    }

    fn load(&self, session_id: &str) -> PerfSession {
        match self.tree.get(session_id) {
            Ok(Some(raw)) => {
                bincode::deserialize(&raw).unwrap_or_else(|_| PerfSession::empty(session_id))
            }
            Ok(None) => PerfSession::empty(session_id),
            Err(e) => {
                warn!(error = %e, session_id, "perf store read failed, starting fresh session");
                PerfSession::empty(session_id)
            }
        }
    }

    /// Idempotent upsert via sled's atomic `fetch_and_update`: concurrent
    /// writers (main task, lane tasks) converge into the same record
    /// vector without a separate external lock.
    pub fn append(&self, session_id: &str, records: Vec<PerfRecord>) {
        if records.is_empty() {
            return;
        }
        let result = self.tree.fetch_and_update(session_id, |old| {
            let mut session = match old {
                Some(raw) => bincode::deserialize::<PerfSession>(raw)
                    .unwrap_or_else(|_| PerfSession::empty(session_id)),
                None => PerfSession::empty(session_id),
            };
            session.records.extend(records.iter().cloned());
            session.recompute_envelope();
            bincode::serialize(&session).ok()
        });
        if let Err(e) = result {
            warn!(error = %e, session_id, "perf store append failed");
        }
    }

    /// `complete()`'s persistence half: recomputes and re-saves the
    /// envelope, returning the current session snapshot.
    pub fn complete(&self, session_id: &str) -> PerfSession {
        let mut session = self.load(session_id);
        session.recompute_envelope();
        if let Ok(encoded) = bincode::serialize(&session) {
            let _ = self.tree.insert(session_id, encoded);
        }
        session
    }

    /// Unions server-pulled records into the local session envelope and
    /// recomputes `session_start_ms`/`session_end_ms`. Records are
    /// deduplicated by full equality so re-pulling the same server page
    /// twice is harmless.
    pub fn merge_server_records(
        &self,
        session_id: &str,
        server_records: Vec<PerfRecord>,
    ) -> PerfSession {
        let mut session = self.load(session_id);
        for record in server_records {
            if !session.records.iter().any(|r| records_equal(r, &record)) {
                session.records.push(record);
            }
        }
        session.recompute_envelope();
        if let Ok(encoded) = bincode::serialize(&session) {
            let _ = self.tree.insert(session_id, encoded);
        }
        session
    }
}

fn records_equal(a: &PerfRecord, b: &PerfRecord) -> bool {
    a.start_ms == b.start_ms
        && a.end_ms == b.end_ms
        && a.channel_group == b.channel_group
        && a.channel_index == b.channel_index
        && a.msg == b.msg
}

/// One tracker instance per thread/task; any number of trackers may share
/// a `session_id` and the same `PerfStoreClient`.
pub struct PerformanceTracker {
    session_id: String,
    store: Arc<PerfStoreClient>,
    open_events: Mutex<HashMap<String, (i64, String, ChannelIndex, String)>>,
}

impl PerformanceTracker {
    pub fn new(session_id: impl Into<String>, store: Arc<PerfStoreClient>) -> Self {
        Self {
            session_id: session_id.into(),
            store,
            open_events: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// `startEvent(eventId, channelGroup, channelIndex, msg)`. Paired with
    /// a later `end_event` by `event_id`.
    pub fn start_event(
        &self,
        event_id: impl Into<String>,
        channel_group: impl Into<String>,
        channel_index: impl Into<ChannelIndex>,
        msg: impl Into<String>,
    ) {
        let mut open = self.open_events.lock().unwrap();
        open.insert(
            event_id.into(),
            (now_ms(), channel_group.into(), channel_index.into(), msg.into()),
        );
    }

    /// `endEvent(eventId)`: emits a record with `start_ms` captured at
    /// `start_event` and `end_ms = now()`.
    pub fn end_event(&self, event_id: &str) {
        let entry = self.open_events.lock().unwrap().remove(event_id);
        let Some((start_ms, channel_group, channel_index, msg)) = entry else {
            warn!(event_id, "end_event called without a matching start_event");
            return;
        };
        let end_ms = now_ms();
        self.store.append(
            &self.session_id,
            vec![PerfRecord {
                start_ms,
                end_ms,
                channel_group,
                channel_index,
                msg,
            }],
        );
    }

    /// `recordEvent(channelGroup, channelIndex, msg, start_ms?, end_ms?)`:
    /// defaults both timestamps to `now()` when omitted.
    pub fn record_event(
        &self,
        channel_group: impl Into<String>,
        channel_index: impl Into<ChannelIndex>,
        msg: impl Into<String>,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) {
        let now = now_ms();
        self.store.append(
            &self.session_id,
            vec![PerfRecord {
                start_ms: start_ms.unwrap_or(now),
                end_ms: end_ms.unwrap_or(now),
                channel_group: channel_group.into(),
                channel_index: channel_index.into(),
                msg: msg.into(),
            }],
        );
    }

    /// Flushes pending writes and persists the session envelope.
    pub fn complete(&self) -> PerfSession {
        self.store.complete(&self.session_id)
    }

    /// Unions server-pulled records into this tracker's session. See
    /// `DataSource::sync_performance`, which fetches the records this
    /// wraps.
    pub fn merge_server_records(&self, server_records: Vec<PerfRecord>) -> PerfSession {
        self.store.merge_server_records(&self.session_id, server_records)
    }
}
