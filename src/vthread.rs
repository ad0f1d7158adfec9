use crate::error::{Fault, fatal};
use crate::pool::Pool;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::thread::{self, ThreadId};
use tracing::trace;

/// Per-base counters backing vthread names: "{base}.{n}".
static NAME_COUNTERS: LazyLock<DashMap<String, u64>> = LazyLock::new(DashMap::new);

fn next_name(base: &str) -> String {
    let mut counter = NAME_COUNTERS.entry(base.to_owned()).or_insert(0);
    let n = *counter;
    *counter += 1;
    format!("{}.{}", base, n)
}

struct VtState {
    body: Option<Box<dyn FnOnce() + Send>>,
    started: bool,
    done: bool,
    /// The OS thread currently inside `run`, if any.
    os_thread: Option<ThreadId>,
    unmanaged: Option<thread::JoinHandle<()>>,
}

/// A one-shot execution context.
///
/// `start` hands the body either to the worker pool (managed) or to a
/// dedicated OS thread (unmanaged). The unmanaged path exists for bodies
/// that block or wait on external completion and must not occupy a pool
/// worker.
///
/// `join` from a managed worker never blocks: it cooperatively runs pending
/// pool items until the target is done.
pub struct VThread {
    name: String,
    pool: Arc<Pool>,
    state: Mutex<VtState>,
    cond: Condvar,
}

impl VThread {
    pub fn new(base: &str) -> Arc<Self> {
        Self::with_pool(base, Arc::clone(Pool::global()))
    }

    pub fn with_pool(base: &str, pool: Arc<Pool>) -> Arc<Self> {
        Arc::new(Self {
            name: next_name(base),
            pool,
            state: Mutex::new(VtState {
                body: None,
                started: false,
                done: false,
                os_thread: None,
                unmanaged: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The OS thread running this vthread right now, if any.
    pub fn id(&self) -> Option<ThreadId> {
        self.state.lock().os_thread
    }

    pub(crate) fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Arms the vthread with its body and dispatches it. May be called at
    /// most once.
    pub fn start(self: &Arc<Self>, body: impl FnOnce() + Send + 'static, managed: bool) {
        let mut state = self.state.lock();
        if state.started {
            fatal(Fault::DoubleStart);
        }
        state.started = true;
        state.body = Some(Box::new(body));

        trace!(vthread = %self.name, managed, "start");

        if managed {
            drop(state);
            self.pool.schedule(Arc::clone(self));
        } else {
            let this = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || this.run())
                .expect("failed to spawn unmanaged thread");
            state.unmanaged = Some(handle);
        }
    }

    pub(crate) fn run(&self) {
        let body = {
            let mut state = self.state.lock();
            state.os_thread = Some(thread::current().id());
            state.body.take()
        };

        if let Some(body) = body {
            body();
        }

        {
            let mut state = self.state.lock();
            state.done = true;
            state.os_thread = None;
        }
        self.cond.notify_all();
    }

    /// Blocks until `run` has completed.
    ///
    /// On a managed worker this runs pending pool items instead of blocking,
    /// and joining the vthread currently running on this worker is an error.
    pub fn join(&self) {
        loop {
            let mut state = self.state.lock();
            if state.done {
                return;
            }

            if self.pool.is_managed_thread() {
                if state.os_thread == Some(thread::current().id()) {
                    fatal(Fault::SelfJoin);
                }
                drop(state);
                self.pool.yield_now();
            } else {
                while !state.done {
                    self.cond.wait(&mut state);
                }
                return;
            }
        }
    }
}

impl Drop for VThread {
    fn drop(&mut self) {
        let mut state = self.state.lock();

        // A taken body means `run` has begun; a body still present means the
        // vthread was never dispatched and nobody will ever complete it.
        if state.started && state.body.is_none() {
            while !state.done {
                if self.pool.is_managed_thread() {
                    fatal(Fault::DestroyWhileRunning);
                }
                self.cond.wait(&mut state);
            }
        }

        let unmanaged = state.unmanaged.take();
        drop(state);

        if let Some(handle) = unmanaged
            && handle.join().is_err()
        {
            tracing::error!(vthread = %self.name, "unmanaged thread panicked");
        }
    }
}

impl fmt::Debug for VThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VThread")
            .field("name", &self.name)
            .field("started", &state.started)
            .field("done", &state.done)
            .finish()
    }
}

/// Cooperative yield on the global pool: runs one pending item with a short
/// wait bound. Valid only from a managed worker.
pub fn yield_now() {
    Pool::global().yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    assert_impl_all!(VThread: Send, Sync);

    #[test]
    fn test_names_are_unique_per_base() {
        let a = VThread::new("vt_name_test");
        let b = VThread::new("vt_name_test");

        let suffix = |vt: &VThread| -> u64 {
            vt.name()
                .rsplit('.')
                .next()
                .unwrap()
                .parse()
                .expect("numeric name suffix")
        };

        assert!(a.name().starts_with("vt_name_test."));
        assert_eq!(suffix(&b), suffix(&a) + 1);
    }

    #[test]
    fn test_unmanaged_join_waits_for_body() {
        let flag = Arc::new(AtomicBool::new(false));
        let vt = VThread::new("vt_unmanaged_test");

        let out = Arc::clone(&flag);
        vt.start(
            move || {
                thread::sleep(Duration::from_millis(30));
                out.store(true, Ordering::Release);
            },
            false,
        );

        vt.join();
        assert!(flag.load(Ordering::Acquire));
        // Cleared once `run` exits.
        assert_eq!(vt.id(), None);
    }

    #[test]
    fn test_managed_runs_on_pool_worker() -> anyhow::Result<()> {
        let pool = private_pool(1)?;
        let seen = Arc::new(Mutex::new(None));

        let out = Arc::clone(&seen);
        let vt = VThread::with_pool("vt_managed_test", Arc::clone(&pool));
        vt.start(move || *out.lock() = Some(thread::current().id()), true);
        vt.join();

        let ran_on = seen.lock().expect("body ran");
        assert_ne!(ran_on, thread::current().id());

        pool.shutdown();
        Ok(())
    }

    #[test]
    #[should_panic(expected = "already started")]
    fn test_double_start() {
        let vt = VThread::new("vt_double_start_test");
        vt.start(|| {}, false);
        vt.start(|| {}, false);
    }
}
