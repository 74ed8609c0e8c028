//! Blocking awaitables over monotone counters
//!
//! The crate models asynchronous completion as waits on observable
//! monotone values: a log's flush position, an attachment's last applied
//! slot, a refcount. [`MonotoneWatch`] is the shared primitive: a u64
//! that only moves forward, with condvar-based waiting and optional
//! timeouts.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{OxipageError, Result};

/// A monotonically increasing value that waiters can block on.
pub struct MonotoneWatch {
    value: Mutex<u64>,
    cond: Condvar,
}

impl MonotoneWatch {
    /// Create a watch starting at `initial`.
    pub fn new(initial: u64) -> Self {
        Self {
            value: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> u64 {
        *self.value.lock()
    }

    /// Advance to `target` if it is ahead of the current value and wake
    /// all waiters. Returns the value after the call.
    pub fn advance_to(&self, target: u64) -> u64 {
        let mut value = self.value.lock();
        if target > *value {
            *value = target;
            self.cond.notify_all();
        }
        *value
    }

    /// Block until the value reaches `target`. Returns the observed
    /// value, which may be past `target`.
    pub fn wait_for(&self, target: u64) -> u64 {
        let mut value = self.value.lock();
        while *value < target {
            self.cond.wait(&mut value);
        }
        *value
    }

    /// Block until the value reaches `target` or the timeout elapses.
    ///
    /// Timing out surfaces as [`OxipageError::Cancelled`]; no persistent
    /// state is affected.
    pub fn wait_for_timeout(&self, target: u64, timeout: Duration) -> Result<u64> {
        let deadline = std::time::Instant::now() + timeout;
        let mut value = self.value.lock();
        while *value < target {
            if self.cond.wait_until(&mut value, deadline).timed_out() {
                return if *value >= target {
                    Ok(*value)
                } else {
                    Err(OxipageError::Cancelled)
                };
            }
        }
        Ok(*value)
    }
}

impl std::fmt::Debug for MonotoneWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotoneWatch")
            .field("value", &self.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_advance_is_monotone() {
        let watch = MonotoneWatch::new(5);
        assert_eq!(watch.get(), 5);
        assert_eq!(watch.advance_to(10), 10);
        assert_eq!(watch.advance_to(7), 10);
        assert_eq!(watch.get(), 10);
    }

    #[test]
    fn test_wait_for_already_reached() {
        let watch = MonotoneWatch::new(100);
        assert_eq!(watch.wait_for(50), 100);
    }

    #[test]
    fn test_wait_for_cross_thread() {
        let watch = Arc::new(MonotoneWatch::new(0));
        let writer = Arc::clone(&watch);

        let handle = thread::spawn(move || {
            for i in 1..=10 {
                writer.advance_to(i);
            }
        });

        let observed = watch.wait_for(10);
        assert!(observed >= 10);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_cancels() {
        let watch = MonotoneWatch::new(0);
        let err = watch
            .wait_for_timeout(1, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, OxipageError::Cancelled));
    }

    #[test]
    fn test_wait_timeout_success() {
        let watch = Arc::new(MonotoneWatch::new(0));
        let writer = Arc::clone(&watch);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            writer.advance_to(3);
        });

        let observed = watch
            .wait_for_timeout(3, Duration::from_secs(5))
            .unwrap();
        assert!(observed >= 3);
        handle.join().unwrap();
    }
}
