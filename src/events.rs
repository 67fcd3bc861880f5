//! Observer registration for completion and progress notifications.
//!
//! Handlers are stored as `Arc`s and snapshotted before invocation so an
//! emitting thread never calls subscriber code while holding the list lock
//! (handlers may re-enter the engine, e.g. to cancel peers).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Shared handler signature: called by whichever thread raises the event.
/// Handlers must not block.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A multicast event: any number of subscribers, fired any number of times.
pub struct EventHandlers<T> {
    handlers: Mutex<Vec<Handler<T>>>,
}

impl<T> EventHandlers<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, handler: Handler<T>) {
        self.handlers.lock().unwrap().push(handler);
    }

    /// Invokes every subscriber with `payload`, outside the list lock.
    pub fn emit(&self, payload: &T) {
        let snapshot: Vec<Handler<T>> = self.handlers.lock().unwrap().clone();
        for handler in snapshot {
            handler(payload);
        }
    }
}

impl<T> Default for EventHandlers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A one-shot event: fires at most once, supports blocking waits.
///
/// Used for task completion where the exactly-once guarantee matters.
pub struct CompletionEvent<T> {
    fired: AtomicBool,
    handlers: EventHandlers<T>,
    signal: Mutex<bool>,
    cond: Condvar,
}

impl<T> CompletionEvent<T> {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            handlers: EventHandlers::new(),
            signal: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn subscribe(&self, handler: Handler<T>) {
        self.handlers.subscribe(handler);
    }

    /// Fires the event if it has not fired yet; later calls are ignored.
    /// Returns true if this call was the one that fired.
    pub fn fire(&self, payload: &T) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.handlers.emit(payload);
        let mut done = self.signal.lock().unwrap();
        *done = true;
        self.cond.notify_all();
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Blocks until the event fires or `timeout` elapses. Returns whether the
    /// event fired. Note that subscribers run before waiters wake.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut done = self.signal.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while !*done {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(done, deadline - now).unwrap();
            done = guard;
        }
        true
    }
}

impl<T> Default for CompletionEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_every_subscriber() {
        let event = EventHandlers::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            event.subscribe(Arc::new(move |v: &u32| {
                count.fetch_add(*v as usize, Ordering::Relaxed);
            }));
        }
        event.emit(&2);
        assert_eq!(count.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn completion_fires_exactly_once() {
        let event = CompletionEvent::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        event.subscribe(Arc::new(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        assert!(event.fire(&()));
        assert!(!event.fire(&()));
        assert!(!event.fire(&()));
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(event.has_fired());
    }

    #[test]
    fn wait_returns_after_fire() {
        let event = Arc::new(CompletionEvent::<()>::new());
        let e = Arc::clone(&event);
        let waiter = std::thread::spawn(move || e.wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        event.fire(&());
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_times_out_when_never_fired() {
        let event = CompletionEvent::<()>::new();
        assert!(!event.wait(Duration::from_millis(30)));
    }

    #[test]
    fn reentrant_emit_does_not_deadlock() {
        let outer = Arc::new(EventHandlers::<u32>::new());
        let inner = Arc::new(EventHandlers::<u32>::new());
        let hit = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hit);
        inner.subscribe(Arc::new(move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        }));
        let inner2 = Arc::clone(&inner);
        let outer2 = Arc::clone(&outer);
        outer.subscribe(Arc::new(move |v: &u32| {
            // Subscribing and emitting from inside a handler must not block.
            outer2.subscribe(Arc::new(|_| {}));
            inner2.emit(v);
        }));
        outer.emit(&1);
        assert_eq!(hit.load(Ordering::Relaxed), 1);
    }
}
