//! Time primitives for the protocol state machines.
//!
//! Machines never read the system clock directly; they are handed a [`Clock`]
//! and compare deadlines against it. Tests drive a [`RefClock`].

use std::cell::Cell;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

/// A local point in time, with millisecond precision.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalTime {
    millis: u128,
}

impl LocalTime {
    /// The current system time.
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Construct from seconds since the UNIX epoch.
    pub fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs as u128 * 1000,
        }
    }

    /// Construct from milliseconds since the UNIX epoch.
    pub fn from_millis(millis: u128) -> Self {
        Self { millis }
    }

    /// Milliseconds since the UNIX epoch.
    pub fn as_millis(&self) -> u128 {
        self.millis
    }

    /// Duration elapsed since `earlier`, saturating at zero.
    pub fn duration_since(&self, earlier: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(earlier.millis))
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.millis)
    }
}

impl From<SystemTime> for LocalTime {
    fn from(t: SystemTime) -> Self {
        let duration = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("system time is set later than the UNIX epoch");

        Self {
            millis: duration.as_millis(),
        }
    }
}

impl Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> Self {
        Self {
            millis: self.millis + other.0,
        }
    }
}

impl AddAssign<LocalDuration> for LocalTime {
    fn add_assign(&mut self, other: LocalDuration) {
        self.millis += other.0;
    }
}

impl Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        self.duration_since(other)
    }
}

/// A duration between two [`LocalTime`]s, with millisecond precision.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalDuration(u128);

impl LocalDuration {
    /// A duration of zero.
    pub const ZERO: LocalDuration = LocalDuration(0);

    /// Construct from seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs as u128 * 1000)
    }

    /// Construct from minutes.
    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Construct from milliseconds.
    pub const fn from_millis(millis: u128) -> Self {
        Self(millis)
    }

    /// The duration in milliseconds.
    pub fn as_millis(&self) -> u128 {
        self.0
    }

    /// The duration in (whole) seconds.
    pub fn as_secs(&self) -> u64 {
        (self.0 / 1000) as u64
    }
}

impl fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1000 && self.0 % 1000 == 0 {
            write!(f, "{}s", self.0 / 1000)
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

impl Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> Self {
        Self(self.0 + other.0)
    }
}

impl Sub<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn sub(self, other: LocalDuration) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Mul<u32> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, n: u32) -> Self {
        Self(self.0 * n as u128)
    }
}

impl From<LocalDuration> for Duration {
    fn from(d: LocalDuration) -> Self {
        Duration::from_millis(d.0 as u64)
    }
}

/// Clocks that tell the local time.
pub trait Clock {
    /// The current local time.
    fn local_time(&self) -> LocalTime;
}

impl Clock for LocalTime {
    fn local_time(&self) -> LocalTime {
        *self
    }
}

/// A shared, manually advanced clock. Useful to drive state machines in
/// tests without sleeping.
#[derive(Debug, Clone, Default)]
pub struct RefClock {
    inner: Rc<Cell<LocalTime>>,
}

impl RefClock {
    /// Create a clock set to `time`.
    pub fn new(time: LocalTime) -> Self {
        Self {
            inner: Rc::new(Cell::new(time)),
        }
    }

    /// Set the clock to `time`.
    pub fn set(&self, time: LocalTime) {
        self.inner.set(time);
    }

    /// Advance the clock by `duration`.
    pub fn elapse(&self, duration: LocalDuration) {
        self.inner.set(self.inner.get() + duration);
    }
}

impl Clock for RefClock {
    fn local_time(&self) -> LocalTime {
        self.inner.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_arithmetic() {
        let t0 = LocalTime::from_secs(100);
        let t1 = t0 + LocalDuration::from_millis(2500);

        assert_eq!(t1 - t0, LocalDuration::from_millis(2500));
        assert_eq!(t0 - t1, LocalDuration::ZERO);
        assert_eq!(LocalDuration::from_secs(3) * 2, LocalDuration::from_secs(6));
    }

    #[test]
    fn test_ref_clock() {
        let clock = RefClock::new(LocalTime::from_secs(1));
        let copy = clock.clone();

        clock.elapse(LocalDuration::from_secs(9));
        assert_eq!(copy.local_time(), LocalTime::from_secs(10));
    }
}
