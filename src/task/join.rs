use std::fmt;

/// A deferred blocking wait, returned by detached `exec`/`finish`.
///
/// The default value carries no wait and joins instantly.
#[derive(Default)]
pub struct Joinable {
    wait: Option<Box<dyn FnOnce() + Send>>,
}

impl Joinable {
    pub(crate) fn new(wait: impl FnOnce() + Send + 'static) -> Self {
        Self {
            wait: Some(Box::new(wait)),
        }
    }

    /// Blocks until the underlying work has finished.
    pub fn join(self) {
        if let Some(wait) = self.wait {
            wait();
        }
    }
}

impl fmt::Debug for Joinable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Joinable")
            .field("pending", &self.wait.is_some())
            .finish()
    }
}

/// A bag of [`Joinable`]s joined together.
#[derive(Debug, Default)]
pub struct Joinables {
    list: Vec<Joinable>,
}

impl Joinables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, joinable: Joinable) {
        self.list.push(joinable);
    }

    pub fn join_all(self) {
        for joinable in self.list {
            joinable.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_joinable_is_a_noop() {
        Joinable::default().join();
    }

    #[test]
    fn test_join_all_runs_every_wait() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut joinables = Joinables::new();

        for _ in 0..3 {
            let h = Arc::clone(&hits);
            joinables.add(Joinable::new(move || {
                h.fetch_add(1, Ordering::Relaxed);
            }));
        }
        joinables.add(Joinable::default());

        joinables.join_all();
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }
}
