pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod server;
pub mod task;

#[cfg(feature = "failpoints")]
pub mod failpoints;
