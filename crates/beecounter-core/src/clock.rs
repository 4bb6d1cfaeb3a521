//! Monotonic and wall-clock time sources.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tracing::debug;

/// Earliest wall-clock time treated as "set" (2023-01-01T00:00:00Z).
///
/// Before NTP sync the device clock starts at the epoch; anything earlier
/// than this means the wall clock is not known yet.
pub const MIN_VALID_UNIX_TIME: i64 = 1_672_531_200;

pub trait Clock: Send + Sync {
    /// Milliseconds since boot. Never goes backwards.
    fn uptime_ms(&self) -> u64;

    /// Seconds since the Unix epoch as reported by the wall clock.
    fn unix_time(&self) -> i64;

    /// Wall-clock time, if it has been set.
    fn wall_time(&self) -> Option<DateTime<Utc>> {
        let secs = self.unix_time();
        if secs < MIN_VALID_UNIX_TIME {
            return None;
        }
        DateTime::from_timestamp(secs, 0)
    }
}

pub struct SystemClock {
    boot: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn uptime_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    fn unix_time(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Set the process time zone from a POSIX TZ string.
///
/// `chrono::Local` re-reads `TZ` whenever it changes.
pub fn set_local_timezone(tz: &str) {
    std::env::set_var("TZ", tz);
    debug!(tz, "local time zone applied");
}

/// Hand-driven clock for tests and simulations.
#[derive(Clone, Default)]
pub struct ManualClock {
    uptime: Arc<AtomicU64>,
    unix: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(uptime_ms: u64, unix_time: i64) -> Self {
        Self {
            uptime: Arc::new(AtomicU64::new(uptime_ms)),
            unix: Arc::new(AtomicI64::new(unix_time)),
        }
    }

    /// Move both clocks forward by `ms` milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        let before = self.uptime.fetch_add(ms, Ordering::SeqCst);
        let crossed = ((before + ms) / 1000 - before / 1000) as i64;
        self.unix.fetch_add(crossed, Ordering::SeqCst);
    }

    pub fn set_unix_time(&self, secs: i64) {
        self.unix.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn uptime_ms(&self) -> u64 {
        self.uptime.load(Ordering::SeqCst)
    }

    fn unix_time(&self) -> i64 {
        self.unix.load(Ordering::SeqCst)
    }
}
