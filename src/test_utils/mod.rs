#![allow(unused)]

use crate::pool::{Builder, Pool};
use crate::stats::Stats;
use crate::task::{FnTask, Task, TaskBase, TaskState, make_task};
use crate::vthread::VThread;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A small pool with its own stats registry, isolated from the global one.
pub(crate) fn private_pool(workers: usize) -> Result<Arc<Pool>> {
    Builder::new()
        .worker_threads(workers)
        .stats(Arc::new(Stats::new()))
        .try_build()
}

/// Shared completion log for asserting execution order across threads.
pub(crate) struct OrderLog {
    entries: Arc<Mutex<Vec<i32>>>,
}

impl OrderLog {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A task that appends `id` to the log when it runs.
    pub(crate) fn task(&self, id: i32) -> Arc<FnTask> {
        let entries = Arc::clone(&self.entries);
        make_task(move || {
            entries.lock().push(id);
        })
    }

    pub(crate) fn entries(&self) -> Vec<i32> {
        self.entries.lock().clone()
    }
}

/// A task that completes out-of-band.
///
/// `run` hands completion to an unmanaged vthread and returns `false`; the
/// vthread sleeps for the configured delay and then moves the task to
/// FINISHED. This is the shape long external waits (device fences, remote
/// completions) take so they never occupy a pool worker.
pub(crate) struct PauseTask {
    base: TaskBase,
    delay: Duration,
    waiter: Mutex<Option<Arc<VThread>>>,
}

pub(crate) fn make_pause_task(delay: Duration) -> Arc<PauseTask> {
    Arc::new(PauseTask {
        base: TaskBase::new(),
        delay,
        waiter: Mutex::new(None),
    })
}

impl PauseTask {
    /// Spin-waits until the out-of-band completion lands.
    pub(crate) fn wait_finished(&self) {
        while self.base.state() != TaskState::Finished {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Task for PauseTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn run(&self) -> bool {
        let base = self.base.clone();
        let delay = self.delay;

        let waiter = VThread::new("pause");
        waiter.start(
            move || {
                thread::sleep(delay);
                base.enter_finished();
            },
            false,
        );

        // Keep the vthread alive past `run`; it joins on task drop.
        *self.waiter.lock() = Some(waiter);
        false
    }
}
