//! Cooperative cancellation and wake-up signals for background work.
//!
//! `CancelToken` is checked by long-running jobs (checkpoint writes, value
//! relocation, waiting for readers) between discrete units of work.
//! `WakeSignal` is the "advise running" latch of the compaction scheduler:
//! advising while the scheduler is busy is remembered and consumed by its
//! next wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A cloneable cancellation flag with interruptible sleeps.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Wakes every sleeper immediately.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let _guard = self.inner.mutex.lock();
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`. Returns `true` if cancelled.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let mut guard = self.inner.mutex.lock();
        if self.is_cancelled() {
            return true;
        }
        self.inner.condvar.wait_for(&mut guard, duration);
        self.is_cancelled()
    }
}

/// Latched wake-up request.
#[derive(Clone, Default)]
pub struct WakeSignal {
    inner: Arc<WakeInner>,
}

#[derive(Default)]
struct WakeInner {
    advised: Mutex<bool>,
    condvar: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advise(&self) {
        let mut advised = self.inner.advised.lock();
        *advised = true;
        self.inner.condvar.notify_all();
    }

    /// Wait until advised or `timeout` elapses, consuming the request.
    /// Returns `true` when a request was consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut advised = self.inner.advised.lock();
        if !*advised {
            self.inner.condvar.wait_for(&mut advised, timeout);
        }
        std::mem::replace(&mut *advised, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_cancel_token_default_not_cancelled() {
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn test_cancel_wakes_sleeper() {
        let token = CancelToken::new();
        let token2 = token.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            (token2.wait_timeout(Duration::from_secs(10)), start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        let (cancelled, elapsed) = handle.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_advise_before_wait_is_latched() {
        let wake = WakeSignal::new();
        wake.advise();
        let start = Instant::now();
        assert!(wake.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!wake.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_without_advise_times_out() {
        let wake = WakeSignal::new();
        assert!(!wake.wait(Duration::from_millis(10)));
    }
}
