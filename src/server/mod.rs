//! Server-side components: task registry, field parsing, preprocessing,
//! performance tracing, and the HTTP surface that ties them together.

pub mod field_parser;
pub mod http;
pub mod perf_store;
pub mod preprocess;
pub mod task_registry;
