use crate::error::{Fault, fatal};
use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type HandlerFn<T> = Arc<dyn Fn(T) + Send + Sync>;

// Most events carry one or two subscribers; keep dispatch snapshots off the
// heap below this.
type HandlerBuf<T> = SmallVec<[(u64, HandlerFn<T>); 4]>;

/// A multicast notification channel.
///
/// Subscribers are stored in generation-counted slots: `attach` returns the
/// slot key, and every slot remembers the generation it was created under.
/// Teardown from either side (the event detaching a listener, or a
/// [`Listener`] being dropped) removes the slot only if the generation still
/// matches, so a stale handle can never remove somebody else's subscription.
///
/// Dispatch order is attach order. Handlers are invoked with no event lock
/// held.
pub struct Event<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

struct Slots<T> {
    handlers: Slab<Handler<T>>,
    next_gen: u64,
}

struct Handler<T> {
    generation: u64,
    owner: u64,
    func: HandlerFn<T>,
}

impl<T: Clone + 'static> Event<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                handlers: Slab::new(),
                next_gen: 0,
            })),
        }
    }

    /// Adds a subscriber owned by `listener` and returns its slot key.
    ///
    /// The listener records the (event, key, generation) binding and removes
    /// it when dropped.
    pub fn attach<F>(&self, listener: &Listener, func: F) -> usize
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (key, generation) = {
            let mut slots = self.slots.lock();
            let generation = slots.next_gen;
            slots.next_gen += 1;

            let key = slots.handlers.insert(Handler {
                generation,
                owner: listener.id,
                func: Arc::new(func),
            });
            (key, generation)
        };

        // The binding holds only a weak reference, so a dropped event makes
        // listener teardown a no-op instead of keeping the slots alive.
        let weak = Arc::downgrade(&self.slots);
        listener.bind(move || {
            if let Some(slots) = weak.upgrade() {
                let mut slots = slots.lock();
                if slots.handlers.get(key).is_some_and(|h| h.generation == generation) {
                    slots.handlers.remove(key);
                }
            }
        });

        key
    }

    /// Removes every subscriber owned by `listener`.
    pub fn detach(&self, listener: &Listener) {
        self.slots
            .lock()
            .handlers
            .retain(|_, h| h.owner != listener.id);
    }

    /// Removes the subscriber in slot `key`. The key must name a live slot.
    pub fn detach_at(&self, key: usize) {
        let mut slots = self.slots.lock();
        if slots.handlers.try_remove(key).is_none() {
            fatal(Fault::InvalidSubscriberIndex);
        }
    }

    /// Invokes every subscriber, in attach order, with a clone of `arg`.
    pub fn dispatch(&self, arg: T) {
        for func in self.snapshot() {
            func(arg.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> impl Iterator<Item = HandlerFn<T>> {
        let slots = self.slots.lock();

        let mut handlers: HandlerBuf<T> = slots
            .handlers
            .iter()
            .map(|(_, h)| (h.generation, Arc::clone(&h.func)))
            .collect();

        // Slab keys get reused, so attach order lives in the generation.
        handlers.sort_by_key(|(generation, _)| *generation);
        handlers.into_iter().map(|(_, f)| f)
    }

    /// Takes every subscriber out of the event, in attach order.
    ///
    /// Used for one-shot events whose subscribers must run exactly once even
    /// when attaches race the dispatch.
    pub(crate) fn drain(&self) -> impl ExactSizeIterator<Item = HandlerFn<T>> {
        let mut slots = self.slots.lock();

        let mut handlers: HandlerBuf<T> = slots
            .handlers
            .drain()
            .map(|h| (h.generation, h.func))
            .collect();

        handlers.sort_by_key(|(generation, _)| *generation);
        handlers.into_iter().map(|(_, f)| f)
    }
}

impl<T: Clone + 'static> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("subscribers", &self.slots.lock().handlers.len())
            .finish()
    }
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Owner of event subscriptions.
///
/// Every `attach` records an unbind closure here; dropping the listener
/// detaches it from every event it is still subscribed to. Bindings whose
/// slot was already drained or detached degrade to no-ops.
pub struct Listener {
    id: u64,
    bindings: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Listener {
    pub fn new() -> Self {
        Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            bindings: Mutex::new(Vec::new()),
        }
    }

    fn bind(&self, unbind: impl FnOnce() + Send + 'static) {
        self.bindings.lock().push(Box::new(unbind));
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let bindings = std::mem::take(&mut *self.bindings.lock());
        for unbind in bindings {
            unbind();
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dispatch_in_attach_order() {
        let event: Event<i32> = Event::new();
        let listener = Listener::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let log = Arc::clone(&log);
            event.attach(&listener, move |arg| log.lock().push((i, arg)));
        }

        event.dispatch(7);
        assert_eq!(*log.lock(), vec![(0, 7), (1, 7), (2, 7), (3, 7)]);
    }

    #[test]
    fn test_detach_by_listener() {
        let event: Event<i32> = Event::new();
        let keep = Listener::new();
        let gone = Listener::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        event.attach(&keep, move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        let h = Arc::clone(&hits);
        event.attach(&gone, move |_| {
            h.fetch_add(100, Ordering::Relaxed);
        });

        event.detach(&gone);
        event.dispatch(0);

        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_listener_drop_detaches() {
        let event: Event<i32> = Event::new();
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let listener = Listener::new();
            let h = Arc::clone(&hits);
            event.attach(&listener, move |_| {
                h.fetch_add(1, Ordering::Relaxed);
            });
            assert_eq!(event.len(), 1);
        }

        assert!(event.is_empty());
        event.dispatch(0);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_drain_takes_subscribers_once() {
        let event: Event<i32> = Event::new();
        let listener = Listener::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        event.attach(&listener, move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });

        for func in event.drain() {
            func(0);
        }
        event.dispatch(0);

        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[should_panic(expected = "invalid index")]
    fn test_detach_at_invalid_key() {
        let event: Event<i32> = Event::new();
        event.detach_at(3);
    }

    #[test]
    fn test_stale_binding_does_not_remove_reused_slot() {
        let event: Event<i32> = Event::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let keep = Listener::new();
        let gone = Listener::new();

        // Free the slot while `gone` still holds its unbind binding, then
        // reuse the key under a new generation.
        let key = event.attach(&gone, |_| {});
        event.detach_at(key);

        let h = Arc::clone(&hits);
        let reused = event.attach(&keep, move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(key, reused);

        // The stale binding sees a generation mismatch and leaves the
        // reused slot alone.
        drop(gone);

        event.dispatch(0);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
