//! Named worker threads with a process-wide live census.
//!
//! Every background thread in chorus-core is spawned through [`spawn`], which
//! names the OS thread (visible in debuggers and `top -H`) and keeps a count of
//! workers that have not yet returned. `stop()` paths are expected to join
//! their workers, so the census returning to its previous value is the
//! observable proof that no thread outlived its owner.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::error::{ChorusError, Result};

static LIVE_WORKERS: AtomicUsize = AtomicUsize::new(0);

/// Number of chorus worker threads currently running.
pub fn live_workers() -> usize {
    LIVE_WORKERS.load(Ordering::SeqCst)
}

struct CensusGuard;

impl Drop for CensusGuard {
    fn drop(&mut self) {
        LIVE_WORKERS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawn a named worker thread that participates in the live census.
///
/// The census is decremented when the closure returns or unwinds.
pub fn spawn<F, T>(name: impl Into<String>, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    LIVE_WORKERS.fetch_add(1, Ordering::SeqCst);
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let _guard = CensusGuard;
            f()
        })
        .map_err(|source| {
            LIVE_WORKERS.fetch_sub(1, Ordering::SeqCst);
            ChorusError::Spawn { name, source }
        })
}

/// Join a worker, logging instead of propagating a panic.
///
/// Shutdown paths must not panic themselves, so a panicked worker is reported
/// and otherwise treated as finished.
pub fn join_logged<T>(handle: JoinHandle<T>) -> Option<T> {
    let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
    match handle.join() {
        Ok(value) => Some(value),
        Err(panic_info) => {
            let msg = panic_info
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic_info.downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("unknown panic");
            warn!(worker = %name, "worker thread panicked: {msg}");
            None
        }
    }
}
