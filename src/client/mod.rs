//! Client-side components: a Rust process (library + CLI) talking HTTP to
//! the server. Lane workers are `tokio` tasks over `mpsc`/`oneshot`, and
//! the two-level cache hierarchy is backed by `sled`.

pub mod byte_cache;
pub mod data_source;
pub mod fetch_worker;
pub mod layout_cache;
pub mod perf_tracker;
