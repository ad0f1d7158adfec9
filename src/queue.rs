use crate::system::sys_debug;
use crate::task::{Joinable, Task, TaskNode, TaskState};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

struct QueueInner {
    head: Option<Arc<TaskNode>>,
    tail: Option<Arc<TaskNode>>,
}

/// Strictly ordered chain of tasks.
///
/// Each pushed task is wrapped in a node released by its predecessor's
/// completion; the head node is released by [`TaskQueue::exec`]. Tasks
/// therefore finish in push order.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                head: None,
                tail: None,
            }),
        }
    }

    /// Appends a task behind everything pushed since the last `exec`.
    ///
    /// Pushing a task that has already FINISHED is a silent no-op: there is
    /// nothing left to run, and wiring it in would release its successor
    /// before the queue is executed.
    pub fn push(&self, task: Arc<dyn Task>) {
        if task.base().state() == TaskState::Finished {
            return;
        }

        let mut inner = self.inner.lock();

        let node = TaskNode::new("task_queue", task, 1, true);
        sys_debug!("task_queue::push", "'{}'", node.name());

        match inner.tail.take() {
            Some(tail) => tail.add_to_notify(&node),
            None => inner.head = Some(Arc::clone(&node)),
        }
        inner.tail = Some(node);
    }

    /// Releases the chain.
    ///
    /// With `detached` set, returns immediately with a [`Joinable`] that
    /// waits for the final task; otherwise waits inline and returns an empty
    /// one. Either way the queue is empty again on return.
    pub fn exec(&self, detached: bool) -> Joinable {
        let (head, tail) = {
            let mut inner = self.inner.lock();
            (inner.head.take(), inner.tail.take())
        };

        sys_debug!("task_queue::exec", "detached {}", detached);

        let (Some(head), Some(tail)) = (head, tail) else {
            return Joinable::default();
        };

        head.notify();

        if detached {
            Joinable::new(move || tail.join())
        } else {
            tail.join();
            Joinable::default()
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TaskQueue")
            .field("empty", &inner.head.is_none())
            .finish()
    }
}
