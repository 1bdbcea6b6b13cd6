//! Clock abstraction for scheduling, backoff and lock expiry.
//!
//! Every timestamp the queue writes (`scheduled_at`, `locked_at`, stale
//! thresholds) comes from a `Clock`, so tests can move time forward instead
//! of sleeping through retry delays.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses `RealClock`; tests inject `TestClock`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Returns the current wall-clock time in UTC.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Real clock backed by the operating system and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for deterministic tests.
///
/// Wall time is stored as microseconds since the epoch so it can be set to
/// any instant, including one before the clock was created. Monotonic time
/// only ever moves forward. Clones share state.
#[derive(Debug, Clone)]
pub struct TestClock {
    wall_micros: Arc<AtomicI64>,
    elapsed_nanos: Arc<AtomicU64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock reading the current time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock reading `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            wall_micros: Arc::new(AtomicI64::new(start.timestamp_micros())),
            elapsed_nanos: Arc::new(AtomicU64::new(0)),
            base_instant: Instant::now(),
        }
    }

    /// Moves wall and monotonic time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.wall_micros.fetch_add(micros, Ordering::AcqRel);
        self.elapsed_nanos.fetch_add(nanos, Ordering::AcqRel);
    }

    /// Sets wall time to `at`. Monotonic time is left untouched.
    pub fn set(&self, at: DateTime<Utc>) {
        self.wall_micros.store(at.timestamp_micros(), Ordering::Release);
    }

    /// Monotonic time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::from(self.now_utc())
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let micros = self.wall_micros.load(Ordering::Acquire);
        DateTime::from_timestamp_micros(micros).unwrap_or_default()
    }
}
