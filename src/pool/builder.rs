use crate::pool::Pool;
use crate::stats::Stats;
use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// How long an idle worker waits for new work before rechecking shutdown.
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let counter = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let prev = counter.fetch_add(1, Ordering::Relaxed);
        format!("weft-worker-{}", prev)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and starts a worker [`Pool`].
///
/// The global pool is built with the defaults; tests and embedders can build
/// private pools with their own sizing and accounting.
#[derive(Debug)]
pub struct Builder {
    /// The number of worker threads.
    ///
    /// Defaults to 1 worker per CPU core.
    worker_threads: Option<usize>,

    /// Name fn used for the pool's OS threads.
    thread_name: ThreadNameFn,

    /// Idle-wait bound for workers; this is what lets shutdown interrupt an
    /// otherwise empty pool.
    idle_timeout: Duration,

    /// Where per-worker busy/idle stats are registered. Defaults to the
    /// global aggregator.
    stats: Option<Arc<Stats>>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            idle_timeout: IDLE_TIMEOUT,
            stats: None,
        }
    }

    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "Worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the name for every OS thread spawned by the pool.
    ///
    /// The default name is "weft-worker-{N}".
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate worker thread names.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    pub fn idle_timeout(mut self, val: Duration) -> Self {
        self.idle_timeout = val;
        self
    }

    /// Registers per-worker stats on a private aggregator instead of the
    /// global one.
    pub fn stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Spawns the workers and returns the running pool.
    pub fn try_build(self) -> Result<Arc<Pool>> {
        let cfg = self.try_into()?;
        Pool::start(cfg)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolved builder state consumed by [`Pool::start`].
#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) idle_timeout: Duration,
    pub(crate) stats: Option<Arc<Stats>>,
}

impl TryFrom<Builder> for PoolConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        Ok(PoolConfig {
            worker_threads,
            thread_name: builder.thread_name,
            idle_timeout: builder.idle_timeout,
            stats: builder.stats,
        })
    }
}
