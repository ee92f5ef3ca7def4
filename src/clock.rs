//! Time and cancellation primitives for the sampling loop.
//!
//! The loop never busy-polls: every wait goes through [`Clock::sleep`], which
//! returns early when the pipeline's [`CancelToken`] is raised. Tests swap the
//! wall clock for a [`ManualClock`] whose sleeps advance virtual time instantly.

use chrono::{DateTime, Duration as ChronoDuration, Local};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Format used for alert timestamps (`YYYY-MM-DD HH:MM:SS`).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Cooperative cancellation signal shared between a supervisor and one pipeline.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake any sleeper.
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap_or_else(|e| e.into_inner());
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block for up to `timeout`. Returns `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Source of time for a pipeline.
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created.
    fn now(&self) -> Duration;

    /// Local wall-clock time, used for alert timestamps.
    fn wall_time(&self) -> DateTime<Local>;

    /// Sleep until `duration` has passed or `cancel` is raised.
    /// Returns `true` when the sleep ended because of cancellation.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;

    fn timestamp(&self) -> String {
        self.wall_time().format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Real clock backed by `Instant` and the local timezone.
#[derive(Clone, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall_time(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        if duration.is_zero() {
            return cancel.is_cancelled();
        }
        cancel.wait_timeout(duration)
    }
}

/// Virtual clock for tests. Sleeping advances time without blocking.
#[derive(Clone, Debug)]
pub struct ManualClock {
    elapsed: Arc<Mutex<Duration>>,
    wall_origin: DateTime<Local>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
            wall_origin: Local::now(),
        }
    }

    /// Move virtual time forward.
    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wall_time(&self) -> DateTime<Local> {
        let elapsed = ChronoDuration::from_std(self.now()).unwrap_or_else(|_| ChronoDuration::zero());
        self.wall_origin + elapsed
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        self.advance(duration);
        cancel.is_cancelled()
    }
}
