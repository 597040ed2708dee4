//! Named-spawn helpers. `tokio::task::Builder::name` requires the
//! `tokio_unstable` cfg, so this falls back to a plain `tokio::spawn` while
//! keeping the named call sites self-documenting at the source level.

use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub fn spawn_named<T, F>(_name: &str, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(future)
}

pub fn spawn_named_on<T, F>(_name: &str, future: F, handle: &Handle) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    handle.spawn(future)
}

pub fn spawn_blocking_named<T, F>(_name: &str, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
}
