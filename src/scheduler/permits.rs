//! Counting semaphore for task-level concurrency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Fixed-capacity permit counter. One permit is one concurrently running
/// task.
pub struct TaskPermits {
    available: Mutex<u32>,
    cond: Condvar,
    max: u32,
}

impl TaskPermits {
    pub fn new(max: u32) -> Self {
        let max = max.max(1);
        Self {
            available: Mutex::new(max),
            cond: Condvar::new(),
            max,
        }
    }

    /// Blocks until a permit is free, polling `cancel`. Returns false when
    /// cancelled instead of acquiring.
    pub fn acquire(&self, cancel: &AtomicBool) -> bool {
        let mut available = self.available.lock().unwrap();
        loop {
            if cancel.load(Ordering::Acquire) {
                return false;
            }
            if *available > 0 {
                *available -= 1;
                return true;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(available, Duration::from_millis(50))
                .unwrap();
            available = guard;
        }
    }

    /// Returns one permit. Clamped at capacity so a double release cannot
    /// inflate concurrency.
    pub fn release(&self) {
        let mut available = self.available.lock().unwrap();
        *available = (*available + 1).min(self.max);
        drop(available);
        self.cond.notify_one();
    }

    pub fn available(&self) -> u32 {
        *self.available.lock().unwrap()
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn acquire_and_release_track_capacity() {
        let permits = TaskPermits::new(2);
        let cancel = AtomicBool::new(false);
        assert_eq!(permits.available(), 2);
        assert!(permits.acquire(&cancel));
        assert!(permits.acquire(&cancel));
        assert_eq!(permits.available(), 0);
        permits.release();
        assert_eq!(permits.available(), 1);
        permits.release();
        assert_eq!(permits.available(), 2);
    }

    #[test]
    fn release_is_clamped_at_capacity() {
        let permits = TaskPermits::new(1);
        permits.release();
        permits.release();
        assert_eq!(permits.available(), 1);
    }

    #[test]
    fn cancelled_acquire_returns_false() {
        let permits = TaskPermits::new(1);
        let cancel = AtomicBool::new(false);
        assert!(permits.acquire(&cancel));

        cancel.store(true, Ordering::Release);
        assert!(!permits.acquire(&cancel));
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let permits = Arc::new(TaskPermits::new(1));
        let cancel = Arc::new(AtomicBool::new(false));
        assert!(permits.acquire(&cancel));

        let p = Arc::clone(&permits);
        let c = Arc::clone(&cancel);
        let waiter = std::thread::spawn(move || p.acquire(&c));
        std::thread::sleep(Duration::from_millis(50));
        permits.release();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let permits = TaskPermits::new(0);
        assert_eq!(permits.max(), 1);
        assert_eq!(permits.available(), 1);
    }
}
