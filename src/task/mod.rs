use crate::error::{Fault, fatal};
use crate::event::{Event, Listener};
use crate::system::sys_debug;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

mod call;
mod join;
mod node;
mod value;

pub use call::{FnTask, make_task};
pub use join::{Joinable, Joinables};
pub use node::TaskNode;
pub use value::TaskValue;

/// Type-erased task result.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Task lifecycle. Transitions are monotonic:
/// CREATED -> RUNNING -> FINISHED, and FINISHED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Finished,
}

pub(crate) enum Claim {
    /// CREATED -> RUNNING: the caller owns this task's `run`.
    Started,
    /// Somebody else is running it; re-entrant `finish` is ignored.
    AlreadyRunning,
    Done,
}

struct BaseInner {
    state: TaskState,
    value: Option<AnyValue>,
}

struct BaseShared {
    inner: Mutex<BaseInner>,
    finished: Event<i32>,
}

/// State machine and finished-notification shared by every task.
///
/// Cloning is shallow: clones observe and drive the same task. That is what
/// lets a body that completes out-of-band hand a handle to whatever thread
/// will eventually call [`TaskBase::enter_finished`].
#[derive(Clone)]
pub struct TaskBase {
    shared: Arc<BaseShared>,
}

impl TaskBase {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BaseShared {
                inner: Mutex::new(BaseInner {
                    state: TaskState::Created,
                    value: None,
                }),
                finished: Event::new(),
            }),
        }
    }

    pub fn state(&self) -> TaskState {
        self.shared.inner.lock().state
    }

    /// The raw finished event.
    ///
    /// Attaching here directly skips the late-subscriber guarantee; use
    /// [`TaskBase::on_finished`] unless the task is known not to be finished.
    pub fn finished(&self) -> &Event<i32> {
        &self.shared.finished
    }

    /// Subscribes to completion.
    ///
    /// If the task is already FINISHED the callback runs synchronously on
    /// the calling thread before this returns; otherwise it runs exactly
    /// once when the task finishes, in attach order, with no task lock held.
    pub fn on_finished<F>(&self, listener: &Listener, func: F)
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        let inner = self.shared.inner.lock();
        if inner.state == TaskState::Finished {
            drop(inner);
            func(0);
        } else {
            // Attach while holding the state lock: enter_finished takes the
            // same lock before draining, so the subscriber either makes the
            // drain or observes FINISHED here. No lost wakeups.
            self.shared.finished.attach(listener, func);
        }
    }

    /// Moves RUNNING -> FINISHED and dispatches the finished event.
    ///
    /// Bodies that return `false` from `run` call this once their external
    /// completion arrives. Calling it in any state but RUNNING is fatal.
    pub fn enter_finished(&self) {
        let drained = {
            let mut inner = self.shared.inner.lock();
            if inner.state != TaskState::Running {
                fatal(Fault::InvalidTransition);
            }
            inner.state = TaskState::Finished;
            self.shared.finished.drain()
        };

        sys_debug!("task::enter_state", "finished, {} subscribers", drained.len());

        for func in drained {
            func(0);
        }
    }

    pub(crate) fn claim(&self) -> Claim {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            TaskState::Created => {
                inner.state = TaskState::Running;
                Claim::Started
            }
            TaskState::Running => Claim::AlreadyRunning,
            TaskState::Finished => Claim::Done,
        }
    }

    pub(crate) fn set_value(&self, value: AnyValue) {
        self.shared.inner.lock().value = Some(value);
    }

    pub(crate) fn value(&self) -> Option<AnyValue> {
        self.shared.inner.lock().value.clone()
    }
}

impl Default for TaskBase {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBase")
            .field("state", &self.state())
            .finish()
    }
}

/// A future computation with a state machine and a finished event.
///
/// `run` does the work: returning `true` means the result was produced
/// synchronously and the task moves straight to FINISHED. Returning `false`
/// means completion was arranged out-of-band; the task stays RUNNING until
/// something calls [`TaskBase::enter_finished`] on its base.
pub trait Task: Send + Sync + 'static {
    fn base(&self) -> &TaskBase;

    fn run(&self) -> bool;

    /// Drives the task, returning `true` iff it is FINISHED on return.
    ///
    /// Idempotent: the first call claims CREATED -> RUNNING and invokes
    /// `run`; a call while RUNNING returns `false`; a call once FINISHED
    /// returns `true`.
    fn finish(&self) -> bool {
        sys_debug!("task::finish", "state {:?}", self.base().state());

        match self.base().claim() {
            Claim::Started => {
                if self.run() {
                    self.base().enter_finished();
                    true
                } else {
                    false
                }
            }
            Claim::AlreadyRunning => false,
            Claim::Done => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    assert_impl_all!(TaskBase: Send, Sync, Clone);

    #[test]
    fn test_sync_finish_produces_value() {
        let task = make_task(|| 41 + 1);

        assert_eq!(task.base().state(), TaskState::Created);
        assert!(task.finish());
        assert_eq!(task.base().state(), TaskState::Finished);
        assert_eq!(task.result().get::<i32>(), 42);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let task = make_task(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });

        assert!(task.finish());
        assert!(task.finish());
        assert!(task.finish());

        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_async_finish_stays_running() {
        let task = make_pause_task(std::time::Duration::from_millis(20));

        assert!(!task.finish());
        assert_eq!(task.base().state(), TaskState::Running);

        // Re-entrant finish while RUNNING is ignored.
        assert!(!task.finish());

        task.wait_finished();
        assert_eq!(task.base().state(), TaskState::Finished);
        assert!(task.finish());
    }

    #[test]
    fn test_subscribers_run_in_attach_order() {
        let task = make_task(|| ());
        let listener = Listener::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = Arc::clone(&log);
            task.base().on_finished(&listener, move |_| log.lock().push(i));
        }

        task.finish();
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    #[should_panic(expected = "not running")]
    fn test_enter_finished_from_created() {
        let base = TaskBase::new();
        base.enter_finished();
    }

    #[test]
    #[should_panic(expected = "not running")]
    fn test_enter_finished_twice() {
        let task = make_task(|| ());
        task.finish();
        task.base().enter_finished();
    }
}
