use crate::error::{Fault, fatal};
use crate::task::{AnyValue, Task};
use std::fmt;
use std::sync::Arc;

/// A handle to a task's eventual result.
///
/// Reading is only defined once the producing task has FINISHED; reading
/// earlier is a usage error. The handle keeps the producing task alive.
#[derive(Clone)]
pub struct TaskValue {
    task: Arc<dyn Task>,
}

impl TaskValue {
    pub fn of(task: Arc<dyn Task>) -> Self {
        Self { task }
    }

    /// The result, checked against `T` at runtime.
    #[track_caller]
    pub fn get<T>(&self) -> T
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.raw().downcast_ref::<T>() {
            Some(value) => value.clone(),
            None => fatal(Fault::TypeMismatch),
        }
    }

    /// The raw, untyped result.
    #[track_caller]
    pub fn get_any(&self) -> AnyValue {
        self.raw()
    }

    #[track_caller]
    fn raw(&self) -> AnyValue {
        match self.task.base().value() {
            Some(value) => value,
            None => panic!("task value read before the producing task finished"),
        }
    }
}

impl fmt::Debug for TaskValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskValue")
            .field("state", &self.task.base().state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::task::{Task, make_task};

    #[test]
    fn test_typed_get() {
        let task = make_task(|| "abc".to_string());
        task.finish();

        assert_eq!(task.result().get::<String>(), "abc");
    }

    #[test]
    fn test_untyped_get() {
        let task = make_task(|| 7_u32);
        task.finish();

        let raw = task.result().get_any();
        assert_eq!(raw.downcast_ref::<u32>(), Some(&7));
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn test_wrong_type() {
        let task = make_task(|| 7_u32);
        task.finish();

        let _ = task.result().get::<String>();
    }

    #[test]
    #[should_panic(expected = "before the producing task finished")]
    fn test_read_before_finish() {
        let task = make_task(|| 7_u32);
        let _ = task.result().get::<u32>();
    }
}
