//! Cooperative cancellation of retry waits

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Cancellation signal for the backoff wait of a retry loop
///
/// Clones share one flag. Cancelling wakes a waiting retry loop at once; the
/// flag stays set, so later retries are interrupted too, until `reset`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake any waiter
    pub fn cancel(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock() = true;
        condvar.notify_all();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Clear a previous cancellation
    pub fn reset(&self) {
        *self.inner.0.lock() = false;
    }

    /// Sleep for `timeout` unless cancelled first
    ///
    /// Returns `true` when the wait ended because of cancellation. A
    /// timeout too large to express as a deadline waits for cancellation
    /// only.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let deadline = Instant::now().checked_add(timeout);
        let mut cancelled = flag.lock();
        while !*cancelled {
            match deadline {
                Some(deadline) => {
                    if condvar.wait_until(&mut cancelled, deadline).timed_out() {
                        break;
                    }
                }
                None => condvar.wait(&mut cancelled),
            }
        }
        *cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_times_out() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let start = Instant::now();
        assert!(token.wait(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(30));
        handle.join().unwrap();
    }

    #[test]
    fn test_unbounded_wait_ends_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        assert!(token.wait(Duration::MAX));
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_is_sticky_until_reset() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.wait(Duration::from_secs(30)));
        token.reset();
        assert!(!token.is_cancelled());
        assert!(!token.wait(Duration::ZERO));
    }
}
