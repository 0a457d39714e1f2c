//! Cooperative cancellation shared by the scheduler, workers and data fetches.
//!
//! Cancelling starts a grace period. Work already in flight may finish while
//! the grace period runs; anything still waiting once it has expired gives up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    flag: AtomicBool,
    cancelled_at: Mutex<Option<Instant>>,
    signal: Condvar,
    grace: Duration,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

impl CancelToken {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                cancelled_at: Mutex::new(None),
                signal: Condvar::new(),
                grace,
            }),
        }
    }

    /// Request cancellation. Idempotent; the grace period starts at the first call.
    pub fn cancel(&self) {
        let mut at = self.lock();
        if at.is_none() {
            *at = Some(Instant::now());
            self.inner.flag.store(true, Ordering::Release);
            self.inner.signal.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    pub fn grace(&self) -> Duration {
        self.inner.grace
    }

    /// Instant after which in-flight work is abandoned.
    pub fn grace_deadline(&self) -> Option<Instant> {
        let cancelled_at = *self.lock();
        cancelled_at.map(|at| at + self.inner.grace)
    }

    pub fn grace_expired(&self) -> bool {
        self.grace_deadline()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Sleep up to `timeout`, waking early on cancellation. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .inner
            .signal
            .wait_timeout_while(guard, timeout, |at| at.is_none())
            .unwrap_or_else(|e| e.into_inner());
        guard.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Instant>> {
        self.inner
            .cancelled_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
