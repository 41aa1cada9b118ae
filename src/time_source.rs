//! Injected clock
//!
//! All time-dependent logic (rate limiting, cache TTLs, session expiry)
//! reads through this trait instead of the OS clock so tests can
//! fast-forward.

use chrono::{DateTime, Utc};
use std::time::Instant;

pub trait TimeSource: Send + Sync {
    /// Monotonic nanoseconds since an arbitrary process-local origin.
    fn monotonic_nanos(&self) -> u64;

    /// Wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production time source backed by `Instant` and the system clock.
pub struct SystemTimeSource {
    origin: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn monotonic_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[cfg(test)]
pub struct ManualTimeSource {
    nanos: std::sync::atomic::AtomicU64,
    base: DateTime<Utc>,
}

#[cfg(test)]
impl ManualTimeSource {
    pub fn new() -> Self {
        Self {
            nanos: std::sync::atomic::AtomicU64::new(0),
            base: Utc::now(),
        }
    }

    pub fn advance_millis(&self, millis: u64) {
        self.nanos.fetch_add(
            millis * 1_000_000,
            std::sync::atomic::Ordering::SeqCst,
        );
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_millis(secs * 1000);
    }
}

#[cfg(test)]
impl TimeSource for ManualTimeSource {
    fn monotonic_nanos(&self) -> u64 {
        self.nanos.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn now(&self) -> DateTime<Utc> {
        self.base
            + chrono::Duration::nanoseconds(
                self.monotonic_nanos() as i64,
            )
    }
}
