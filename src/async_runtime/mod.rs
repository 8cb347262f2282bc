//! The async runtime used by the reactor and dispatcher.
//!
//! A thin wrapper around a shared multi-threaded [`tokio::runtime::Runtime`],
//! mirroring the teacher's `bft::async_runtime` module: callers `spawn`
//! onto it and never construct a `Runtime` themselves.

use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

use crate::error::{ErrorKind, Result, ResultWrappedExt};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Initializes the shared runtime with `worker_threads` network threads
/// (the spec's `net_thread_num`, §4.4). Idempotent: a second call is a
/// no-op returning `Ok(())`, matching `bft::init`'s "already initialized"
/// short-circuit.
pub fn init(worker_threads: usize) -> Result<()> {
    if RUNTIME.get().is_some() {
        return Ok(());
    }
    let rt = Builder::new_multi_thread()
        .worker_threads(worker_threads.max(1))
        .thread_name("elliptics-net")
        .enable_all()
        .build()
        .wrapped(ErrorKind::Transport)?;
    // Another thread may have won the race to initialize; that's fine,
    // the loser's runtime is simply dropped.
    let _ = RUNTIME.set(rt);
    Ok(())
}

fn runtime() -> &'static Runtime {
    RUNTIME
        .get()
        .expect("async_runtime::init must run before spawn/block_on")
}

/// Spawns a future onto the shared runtime, returning a handle.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    runtime().spawn(fut)
}

/// Blocks the calling thread until `fut` completes, driving the shared
/// runtime. Intended for the embedder's `main`, not for use from within
/// a reactor task.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    runtime().block_on(fut)
}
