//! Time types for the station.
//!
//! Timer-driven behaviour (protocol timeouts, comeback retries, PTKSA
//! expiry) reads "now" from an injected [`Clock`] so simulations and tests
//! can run on virtual time.

use std::cell::Cell;
use std::ops::{Add, Sub};
use std::rc::Rc;
use std::time::Instant;

/// Monotonic timestamp in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1000))
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Seconds, truncated.
    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1000
    }

    #[inline]
    pub const fn saturating_add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.0))
    }

    #[inline]
    pub const fn saturating_sub(self, other: Timestamp) -> Duration {
        Duration(self.0.saturating_sub(other.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        self.saturating_add(rhs)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.saturating_sub(rhs)
    }
}

/// Span of time in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(u64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs.saturating_mul(1000))
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1000
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        std::time::Duration::from_millis(d.0)
    }
}

/// Source of the current time.
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Wall-clock backed monotonic time, measured from construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Converts a [`Timestamp`] of this clock back into an [`Instant`].
    pub fn instant_at(&self, at: Timestamp) -> Instant {
        self.origin + std::time::Duration::from_millis(at.as_millis())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.origin.elapsed().as_millis() as u64)
    }
}

/// Manually advanced clock. Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    current: Rc<Cell<Timestamp>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(time: Timestamp) -> Self {
        Self {
            current: Rc::new(Cell::new(time)),
        }
    }

    pub fn set(&self, time: Timestamp) {
        self.current.set(time);
    }

    pub fn advance(&self, by: Duration) {
        self.current.set(self.current.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.current.get()
    }
}
