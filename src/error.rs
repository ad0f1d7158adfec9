/// Programmer errors detectable by the scheduler at runtime.
///
/// None of these are expected at steady state. Every one of them means the
/// calling code broke a scheduler invariant, so they are raised as panics at
/// the point of detection rather than surfaced as `Result`s.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A task was moved to FINISHED while it was not RUNNING.
    #[error("task entered FINISHED while not running")]
    InvalidTransition,

    /// `VThread::start` was called a second time.
    #[error("vthread already started")]
    DoubleStart,

    /// A managed worker tried to join the virtual thread it is running.
    #[error("managed worker joining its own vthread")]
    SelfJoin,

    /// A virtual thread was dropped by a managed worker while its `run` was
    /// still in progress.
    #[error("vthread dropped while running on a managed worker")]
    DestroyWhileRunning,

    /// `TaskNode::notify` was called with a wait count of zero.
    #[error("task node notified with zero wait count")]
    WaitCountUnderflow,

    /// A subscriber was detached with a key that names no live slot.
    #[error("detaching subscriber with invalid index")]
    InvalidSubscriberIndex,

    /// A task value was read with the wrong concrete type.
    #[error("task value type mismatch")]
    TypeMismatch,
}

#[cold]
pub(crate) fn fatal(fault: Fault) -> ! {
    panic!("{}", fault)
}
