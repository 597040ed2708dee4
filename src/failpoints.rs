//! Failpoint injection hook, gated behind the `failpoints` feature. Used
//! by integration tests to reproduce 202-exhaustion and task-TTL expiry
//! scenarios deterministically, without real wall-clock sleeps.

pub use fail::fail_point;

/// When set, `GET /voxel-grid/chunk` always answers 202, regardless of the
/// slot's real state.
pub const CHUNK_ALWAYS_NOT_READY: &str = "chunk_always_not_ready";

/// When set, a task is treated as already expired the instant it's looked
/// up, regardless of its real TTL.
pub const TASK_ALWAYS_EXPIRED: &str = "task_always_expired";
