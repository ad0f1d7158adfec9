use crate::task::{AnyValue, Task, TaskBase, TaskValue};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type Body = Box<dyn FnOnce() -> AnyValue + Send>;

/// A task built from a callable.
///
/// `run` invokes the callable once, stores its return value, and reports
/// synchronous completion. Created through [`make_task`].
pub struct FnTask {
    base: TaskBase,
    body: Mutex<Option<Body>>,
}

/// Builds a task from a callable.
///
/// Arguments are whatever the closure captures. Capture a [`TaskValue`] from
/// an upstream task to consume its result; that expresses the data flow but
/// does not order execution, which belongs to the queue or list the tasks are
/// placed in:
///
/// ```
/// use weft::{TaskQueue, make_task};
///
/// let hello = make_task(|| "hello".to_string());
/// let result = hello.result();
/// let shout = make_task(move || format!("{}!", result.get::<String>()));
///
/// let queue = TaskQueue::new();
/// queue.push(hello);
/// queue.push(shout.clone());
/// queue.exec(false).join();
///
/// assert_eq!(shout.result().get::<String>(), "hello!");
/// ```
pub fn make_task<F, R>(func: F) -> Arc<FnTask>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + Sync + 'static,
{
    Arc::new(FnTask {
        base: TaskBase::new(),
        body: Mutex::new(Some(Box::new(move || Arc::new(func()) as AnyValue))),
    })
}

impl FnTask {
    /// A handle to this task's eventual result.
    pub fn result(self: &Arc<Self>) -> TaskValue {
        let task: Arc<dyn Task> = self.clone();
        TaskValue::of(task)
    }
}

impl Task for FnTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn run(&self) -> bool {
        let body = self
            .body
            .lock()
            .take()
            .expect("task body already consumed");

        self.base.set_value(body());
        true
    }
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask")
            .field("state", &self.base.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

    #[test]
    fn test_unit_return_is_stored() {
        let task = make_task(|| {});
        task.finish();

        assert_eq!(task.base().state(), TaskState::Finished);
        task.result().get::<()>();
    }

    #[test]
    fn test_captured_value_handle_reads_upstream() {
        let upstream = make_task(|| vec![1, 2, 3]);
        let handle = upstream.result();
        let downstream = make_task(move || handle.get::<Vec<i32>>().len());

        upstream.finish();
        downstream.finish();

        assert_eq!(downstream.result().get::<usize>(), 3);
    }
}
