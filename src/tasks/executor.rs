//! Background Executor
//!
//! Runs expiration scans, compaction and eviction callbacks off the
//! caller's thread on a tokio runtime.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

const WORKER_THREADS: usize = 2;

// == Executor ==
/// Fire-and-forget task submission. Cloning shares the same runtime.
#[derive(Debug, Clone)]
pub(crate) struct Executor {
    handle: Handle,
}

/// A runtime created for a cache that was built outside of one.
///
/// Shut down in the background when dropped, which is safe from async
/// contexts as well.
#[derive(Debug)]
pub(crate) struct OwnedRuntime {
    runtime: Option<Runtime>,
}

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            debug!("background runtime shut down");
        }
    }
}

impl Executor {
    /// Reuses the surrounding multi-threaded tokio runtime, or starts a
    /// small dedicated one.
    ///
    /// A current-thread runtime is never reused: its tasks would only run
    /// while the caller yields, and cache operations are synchronous.
    pub(crate) fn current_or_owned() -> Result<(Self, Option<OwnedRuntime>)> {
        if let Ok(handle) = Handle::try_current() {
            if handle.runtime_flavor() == RuntimeFlavor::MultiThread {
                return Ok((Self { handle }, None));
            }
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("mini-memcache-worker")
            .enable_all()
            .build()
            .map_err(|err| CacheError::Executor(err.to_string()))?;
        debug!(workers = WORKER_THREADS, "started background runtime");

        let executor = Self {
            handle: runtime.handle().clone(),
        };
        Ok((
            executor,
            Some(OwnedRuntime {
                runtime: Some(runtime),
            }),
        ))
    }

    /// Runs `task` on the blocking pool. A panic is logged and dropped.
    pub(crate) fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _detached = self.handle.spawn_blocking(move || {
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                warn!("background cache task panicked");
            }
        });
    }

    /// Spawns an async task on the runtime.
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future)
    }
}
