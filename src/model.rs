//! Shared data model for the voxel-grid pipeline.
//!
//! Types here cross process boundaries (HTTP JSON, sled values) so every
//! public type derives `Serialize`/`Deserialize`.

use serde::{Deserialize, Serialize};

/// `(nx, ny, nz)` extent of a scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub nx: u64,
    pub ny: u64,
    pub nz: u64,
}

impl Shape {
    pub fn new(nx: u64, ny: u64, nz: u64) -> Self {
        Self { nx, ny, nz }
    }

    /// Total element count, `nx * ny * nz`.
    pub fn data_length(&self) -> u64 {
        self.nx * self.ny * self.nz
    }
}

/// Half-open `[start, end)` element-offset slice of the flat field.
///
/// Invariant: `start < end`; for ascending indices the slices tile
/// `[0, data_length)` with no gaps or overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkDescriptor {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn byte_len(&self) -> u64 {
        self.len() * 8
    }
}

/// Splits `[0, data_length)` into ascending, contiguous chunks of
/// `chunk_size` elements, the last possibly shorter.
pub fn chunk_descriptors(data_length: u64, chunk_size: u64) -> Vec<ChunkDescriptor> {
    assert!(chunk_size >= 1, "chunk_size must be >= 1");
    if data_length == 0 {
        return Vec::new();
    }
    let mut chunks = Vec::with_capacity(data_length.div_ceil(chunk_size) as usize);
    let mut start = 0u64;
    let mut index = 0u32;
    while start < data_length {
        let end = (start + chunk_size).min(data_length);
        chunks.push(ChunkDescriptor { index, start, end });
        start = end;
        index += 1;
    }
    chunks
}

/// The response to `POST /voxel-grid/preprocess`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessResponse {
    pub task_id: String,
    pub file: String,
    pub file_size: u64,
    pub file_mtime_unix: u64,
    pub shape: Shape,
    pub data_length: u64,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkDescriptor>,
}

/// The response to `GET /voxel-grid/stat`: a cheap file identity check,
/// with no registry side effect, used by `StalenessPolicy::Strict`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FileStatResponse {
    pub file_size: u64,
    pub file_mtime_unix: u64,
}

/// A chunk persisted in the client's byte cache, keyed by
/// `(file, chunk_size, chunk_index)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCachedChunk {
    pub bytes: Vec<u8>,
    pub min: f64,
    pub max: f64,
    pub timestamp_ms: i64,
}

/// The client's short-circuit for a prior preprocess call, keyed by
/// `(file, chunk_size)`.
///
/// `file_size`/`file_mtime_unix` are carried so a `StalenessPolicy::Strict`
/// caller can detect a file that changed server-side without forcing every
/// caller to pay a stat round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutRecord {
    pub shape: Shape,
    pub chunks: Vec<ChunkDescriptor>,
    pub data_length: u64,
    pub chunk_size: u64,
    pub file_size: u64,
    pub file_mtime_unix: u64,
}

/// What a successful `loadData` call hands back.
///
/// `global_min`/`global_max` are `None` only for the degenerate empty-field
/// case — modeled as the absence of a value rather than a sentinel float,
/// so callers can't accidentally feed an infinity into a mesher.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub bytes: Vec<u8>,
    pub shape: Shape,
    pub data_length: u64,
    pub global_min: Option<f64>,
    pub global_max: Option<f64>,
    pub task_id: Option<String>,
    pub fetch_ms: u64,
    pub all_from_cache: bool,
}

/// A record in a performance trace session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfRecord {
    pub start_ms: i64,
    pub end_ms: i64,
    pub channel_group: String,
    pub channel_index: ChannelIndex,
    pub msg: String,
}

/// `channel_index` is string-or-int in the source protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelIndex {
    Int(i64),
    Str(String),
}

impl From<i64> for ChannelIndex {
    fn from(v: i64) -> Self {
        ChannelIndex::Int(v)
    }
}

impl From<&str> for ChannelIndex {
    fn from(v: &str) -> Self {
        ChannelIndex::Str(v.to_string())
    }
}

/// `GET /performance`'s wire shape for one record — `start_time`/`end_time`
/// on the wire, `start_ms`/`end_ms` internally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfRecordWire {
    pub start_time: i64,
    pub end_time: i64,
    pub channel_group: String,
    pub channel_index: ChannelIndex,
    pub msg: String,
}

impl From<&PerfRecord> for PerfRecordWire {
    fn from(r: &PerfRecord) -> Self {
        Self {
            start_time: r.start_ms,
            end_time: r.end_ms,
            channel_group: r.channel_group.clone(),
            channel_index: r.channel_index.clone(),
            msg: r.msg.clone(),
        }
    }
}

impl From<PerfRecordWire> for PerfRecord {
    fn from(r: PerfRecordWire) -> Self {
        Self {
            start_ms: r.start_time,
            end_ms: r.end_time,
            channel_group: r.channel_group,
            channel_index: r.channel_index,
            msg: r.msg,
        }
    }
}

/// The response to `GET /performance?session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceResponse {
    pub session_id: String,
    pub records: Vec<PerfRecordWire>,
}

/// The persisted envelope for one tracing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfSession {
    pub session_id: String,
    pub session_start_ms: i64,
    pub session_end_ms: i64,
    pub records: Vec<PerfRecord>,
    pub metadata: Option<serde_json::Value>,
}

impl PerfSession {
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            session_start_ms: 0,
            session_end_ms: 0,
            records: Vec::new(),
            metadata: None,
        }
    }

    /// Recomputes `session_start_ms`/`session_end_ms` from `records`, so
    /// multiple writers merging into one session stay consistent.
    pub fn recompute_envelope(&mut self) {
        self.session_start_ms = self.records.iter().map(|r| r.start_ms).min().unwrap_or(0);
        self.session_end_ms = self.records.iter().map(|r| r.end_ms).max().unwrap_or(0);
    }
}
