use crate::clock::Clock;
use crate::stats::{Stat, Stats};
use crate::vthread::VThread;
use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::{Arc, Barrier, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, trace};

mod builder;
pub use builder::Builder;
pub(crate) use builder::PoolConfig;

/// Idle-wait bound used by the cooperative yield path.
const YIELD_TIMEOUT: Duration = Duration::from_millis(10);

struct Shared {
    /// Pending virtual threads. A stack: the most recently scheduled item is
    /// usually a continuation of what is running now, so it runs first while
    /// its data is still warm.
    stack: Vec<Arc<VThread>>,
    running: usize,
    shutdown: bool,
}

/// Fixed set of worker threads draining a shared LIFO stack of
/// [`VThread`]s.
///
/// Workers never block indefinitely inside a work item: anything that has to
/// wait from a managed thread goes through [`Pool::yield_now`], which runs
/// one pending item instead. The process-wide instance is behind
/// [`Pool::global`]; private pools can be built with [`Builder`].
pub struct Pool {
    cfg: PoolConfig,
    shared: Mutex<Shared>,
    cond: Condvar,
    worker_ids: OnceLock<Vec<ThreadId>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Pool {
    pub fn global() -> &'static Arc<Pool> {
        static GLOBAL: OnceLock<Arc<Pool>> = OnceLock::new();

        GLOBAL.get_or_init(|| {
            Builder::new()
                .try_build()
                .expect("failed to start the global worker pool")
        })
    }

    pub(crate) fn start(cfg: PoolConfig) -> Result<Arc<Pool>> {
        let pool = Arc::new(Pool {
            cfg: cfg.clone(),
            shared: Mutex::new(Shared {
                stack: Vec::new(),
                running: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
            worker_ids: OnceLock::new(),
            handles: Mutex::new(Vec::new()),
        });

        // Workers hold the barrier until their thread ids are registered, so
        // `is_managed_thread` is reliable from the first dispatched item.
        let barrier = Arc::new(Barrier::new(cfg.worker_threads + 1));
        let mut handles = Vec::with_capacity(cfg.worker_threads);

        for i in 0..cfg.worker_threads {
            let stat = match &cfg.stats {
                Some(stats) => stats.make_stat(format!("cpu.{}", i)),
                None => Stats::global().make_stat(format!("cpu.{}", i)),
            };

            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);

            let handle = thread::Builder::new()
                .name((cfg.thread_name.0)())
                .spawn(move || {
                    barrier.wait();
                    pool.worker_loop(&stat);
                })
                .context("failed to spawn worker thread")?;

            handles.push(handle);
        }

        let ids: Vec<ThreadId> = handles.iter().map(|h| h.thread().id()).collect();
        pool.worker_ids
            .set(ids)
            .expect("worker ids already registered");
        *pool.handles.lock() = handles;

        barrier.wait();

        debug!(workers = cfg.worker_threads, "pool started");
        Ok(pool)
    }

    /// Pushes a virtual thread onto the stack and wakes one worker. Never
    /// blocks.
    pub fn schedule(&self, vt: Arc<VThread>) {
        trace!(vthread = %vt.name(), "schedule");

        self.shared.lock().stack.push(vt);
        self.cond.notify_one();
    }

    /// Runs at most one pending virtual thread.
    ///
    /// Waits up to `timeout` when the stack is empty, accounts idle and busy
    /// seconds into `stat`, and returns without running anything on shutdown
    /// or timeout.
    pub fn once(&self, stat: Option<&Stat>, timeout: Duration) {
        let mut clock = Clock::new();
        let mut shared = self.shared.lock();

        if shared.stack.is_empty() {
            let _ = self.cond.wait_for(&mut shared, timeout);
        }

        if let Some(stat) = stat {
            stat.report_idle(clock.reset());
        }

        if shared.shutdown {
            return;
        }

        let Some(vt) = shared.stack.pop() else {
            return;
        };

        shared.running += 1;
        trace!(
            running = shared.running,
            stacked = shared.stack.len(),
            vthread = %vt.name(),
            "dispatch"
        );
        drop(shared);

        vt.run();

        self.shared.lock().running -= 1;

        if let Some(stat) = stat {
            stat.report_busy(clock.reset());
        }
    }

    /// Whether the calling OS thread is one of this pool's workers.
    ///
    /// Managed threads must never wait unboundedly: anything queued behind
    /// the waiter could itself be scheduled on this pool.
    pub fn is_managed_thread(&self) -> bool {
        self.worker_ids
            .get()
            .is_some_and(|ids| ids.contains(&thread::current().id()))
    }

    /// Runs one pending item with a short wait bound instead of blocking.
    /// Valid only on a managed worker.
    #[track_caller]
    pub fn yield_now(&self) {
        assert!(
            self.is_managed_thread(),
            "yield from a thread outside the worker pool"
        );
        self.once(None, YIELD_TIMEOUT);
    }

    pub fn worker_count(&self) -> usize {
        self.cfg.worker_threads
    }

    /// Stops the workers and joins them. Idempotent; must not be called from
    /// a managed worker.
    #[track_caller]
    pub fn shutdown(&self) {
        assert!(
            !self.is_managed_thread(),
            "shutdown from inside the worker pool"
        );

        {
            let mut shared = self.shared.lock();
            shared.shutdown = true;
        }
        self.cond.notify_all();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }

        debug!("pool shut down");
    }

    fn worker_loop(&self, stat: &Stat) {
        while !self.shared.lock().shutdown {
            self.once(Some(stat), self.cfg.idle_timeout);
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Workers hold their own handle to the pool, so by the time the last
        // one drops they have already exited; this only reaps stragglers.
        self.shutdown();
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("Pool")
            .field("workers", &self.cfg.worker_threads)
            .field("stacked", &shared.stack.len())
            .field("running", &shared.running)
            .field("shutdown", &shared.shutdown)
            .finish()
    }
}
