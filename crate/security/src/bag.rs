//! A bounded bag of reusable resources with blocking borrows.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// Holds pre-built single-threaded resources (signer engines, digesters) and
/// hands them out to one user at a time. `borrow` blocks up to the given
/// timeout; `requite` returns the resource and wakes one waiter.
pub struct ConcurrentBag<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> Default for ConcurrentBag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcurrentBag<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn add(&self, item: T) {
        self.items.lock().expect("bag poisoned").push_back(item);
        self.available.notify_one();
    }

    /// Takes an item, waiting up to `timeout` for one to become available.
    pub fn borrow(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock().expect("bag poisoned");
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(items, remaining)
                .expect("bag poisoned");
            items = guard;
        }
    }

    pub fn requite(&self, item: T) {
        self.add(item);
    }

    /// Number of items currently idle in the bag.
    pub fn idle_count(&self) -> usize {
        self.items.lock().expect("bag poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn borrow_and_requite() {
        let bag = ConcurrentBag::new();
        bag.add(1);
        bag.add(2);
        let a = bag.borrow(Duration::from_millis(10)).unwrap();
        let b = bag.borrow(Duration::from_millis(10)).unwrap();
        assert_eq!(a + b, 3);
        assert!(bag.borrow(Duration::from_millis(20)).is_none());
        bag.requite(a);
        assert_eq!(bag.borrow(Duration::from_millis(10)), Some(a));
    }

    #[test]
    fn waiter_is_woken_by_requite() {
        let bag = Arc::new(ConcurrentBag::new());
        bag.add(7_u32);
        let item = bag.borrow(Duration::from_millis(10)).unwrap();

        let waiter = {
            let bag = bag.clone();
            thread::spawn(move || bag.borrow(Duration::from_secs(2)))
        };
        thread::sleep(Duration::from_millis(50));
        bag.requite(item);
        assert_eq!(waiter.join().unwrap(), Some(7));
    }
}
