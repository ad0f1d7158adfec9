use crate::error::{Fault, fatal};
use crate::event::Listener;
use crate::system::sys_debug;
use crate::task::Task;
use crate::vthread::VThread;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::trace;

struct NodeSync {
    /// Releases outstanding before the task may be dispatched. Strictly
    /// positive at construction; reaching zero dispatches exactly once.
    wait: u32,
    /// Mirrors the task's FINISHED state for joiners.
    finished: bool,
}

/// A scheduler vertex: one task plus the wait count that gates it.
///
/// Each `notify` consumes one count; the notify that reaches zero starts the
/// node's [`VThread`] with `task.finish()` as the body. Downstream nodes
/// subscribe to this node's task via [`TaskNode::add_to_notify`]; because
/// subscription goes through the late-subscriber path, depending on an
/// already-finished node releases the dependent immediately.
pub struct TaskNode {
    task: Arc<dyn Task>,
    vthread: Arc<VThread>,
    managed: bool,
    sync: Mutex<NodeSync>,
    cond: Condvar,
    /// Owns this node's subscription on its task; dropping the node detaches
    /// it.
    listener: Listener,
}

impl TaskNode {
    pub fn new(name: &str, task: Arc<dyn Task>, wait: u32, managed: bool) -> Arc<Self> {
        assert!(wait > 0, "task node requires a positive wait count");

        let node = Arc::new(Self {
            task: Arc::clone(&task),
            vthread: VThread::new(name),
            managed,
            sync: Mutex::new(NodeSync {
                wait,
                finished: false,
            }),
            cond: Condvar::new(),
            listener: Listener::new(),
        });

        // Weak so the subscription never keeps the node alive on its own;
        // if the task was already finished this fires before we return.
        let weak = Arc::downgrade(&node);
        task.base().on_finished(&node.listener, move |_| {
            if let Some(node) = weak.upgrade() {
                node.sync.lock().finished = true;
                node.cond.notify_all();
            }
        });

        node
    }

    /// Wires `downstream` to receive one `notify` when this node's task
    /// finishes. Fires immediately if it already has.
    pub fn add_to_notify(&self, downstream: &Arc<TaskNode>) {
        let node = Arc::clone(downstream);
        self.task
            .base()
            .on_finished(&downstream.listener, move |_| node.notify());
    }

    /// Consumes one wait count; the count that reaches zero dispatches the
    /// task on this node's vthread.
    pub fn notify(&self) {
        let mut sync = self.sync.lock();

        sys_debug!(
            "task_node::notify",
            "'{}' wait {} -> {}",
            self.vthread.name(),
            sync.wait,
            sync.wait.saturating_sub(1),
        );

        if sync.wait == 0 {
            fatal(Fault::WaitCountUnderflow);
        }
        sync.wait -= 1;

        if sync.wait == 0 {
            trace!(node = %self.vthread.name(), "released");

            let task = Arc::clone(&self.task);
            self.vthread.start(
                move || {
                    task.finish();
                },
                self.managed,
            );
        }
    }

    /// Blocks until the task has FINISHED; cooperatively yields when called
    /// from a managed worker.
    pub fn join(&self) {
        loop {
            let mut sync = self.sync.lock();
            if sync.finished {
                return;
            }

            let pool = self.vthread.pool();
            if pool.is_managed_thread() {
                drop(sync);
                pool.yield_now();
            } else {
                while !sync.finished {
                    self.cond.wait(&mut sync);
                }
                return;
            }
        }
    }

    pub fn name(&self) -> &str {
        self.vthread.name()
    }

    /// The OS thread currently running the node's task, if any.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.vthread.id()
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sync = self.sync.lock();
        f.debug_struct("TaskNode")
            .field("name", &self.vthread.name())
            .field("wait", &sync.wait)
            .field("finished", &sync.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::make_task;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_dispatch_on_last_notify() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let task = make_task(move || flag.store(true, Ordering::Release));

        let node = TaskNode::new("node_test", task, 2, true);

        node.notify();
        assert!(!ran.load(Ordering::Acquire));

        node.notify();
        node.join();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    #[should_panic(expected = "zero wait count")]
    fn test_notify_underflow() {
        let task = make_task(|| ());
        let node = TaskNode::new("node_underflow_test", task, 1, true);

        node.notify();
        node.join();
        node.notify();
    }

    #[test]
    #[should_panic(expected = "positive wait count")]
    fn test_zero_wait_rejected() {
        let task = make_task(|| ());
        let _ = TaskNode::new("node_zero_test", task, 0, true);
    }

    #[test]
    fn test_notify_finished_dependency_fires_immediately() {
        let upstream = TaskNode::new("node_dep_test", make_task(|| ()), 1, true);
        upstream.notify();
        upstream.join();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let downstream = TaskNode::new(
            "node_dep_test",
            make_task(move || flag.store(true, Ordering::Release)),
            2,
            true,
        );

        // One count from the already-finished upstream, one release.
        upstream.add_to_notify(&downstream);
        downstream.notify();
        downstream.join();

        assert!(ran.load(Ordering::Acquire));
    }
}
