//! Normalized (seconds, nanoseconds) time values.
//!
//! `TimeSpec` is the crate's one time currency: the scheduler keys events by
//! monotonic `TimeSpec`s, the reactor turns the next fire time into a ppoll
//! timeout, and the network primitives compute absolute deadlines with it.
//! Every operation maintains `0 <= nsec < 1_000_000_000`.

use std::time::Duration;

use crate::error::{Error, Result};

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimeSpec {
    sec: i64,
    nsec: i64,
}

impl TimeSpec {
    pub const ZERO: TimeSpec = TimeSpec { sec: 0, nsec: 0 };

    /// Build a normalized value. `nsec` may carry past a second in either
    /// direction; the carry is folded into `sec`.
    pub fn new(sec: i64, nsec: i64) -> TimeSpec {
        // Euclidean division floors, so nsec lands in [0, 1e9) and the
        // borrow/carry folds into sec in one step.
        TimeSpec {
            sec: sec + nsec.div_euclid(NANOS_PER_SEC),
            nsec: nsec.rem_euclid(NANOS_PER_SEC),
        }
    }

    /// Current CLOCK_MONOTONIC reading.
    pub fn now_monotonic() -> TimeSpec {
        Self::clock(libc::CLOCK_MONOTONIC)
    }

    /// Current CLOCK_REALTIME reading.
    pub fn now_realtime() -> TimeSpec {
        Self::clock(libc::CLOCK_REALTIME)
    }

    fn clock(id: libc::clockid_t) -> TimeSpec {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // clock_gettime only fails for an invalid clock id.
        unsafe { libc::clock_gettime(id, &mut ts) };
        TimeSpec { sec: ts.tv_sec as i64, nsec: ts.tv_nsec as i64 }
    }

    pub fn sec(&self) -> i64 {
        self.sec
    }

    pub fn nsec(&self) -> i64 {
        self.nsec
    }

    pub fn checked_add(self, other: TimeSpec) -> TimeSpec {
        TimeSpec::new(self.sec + other.sec, self.nsec + other.nsec)
    }

    /// `self - other`, failing when the result would be negative.
    pub fn checked_sub(self, other: TimeSpec) -> Result<TimeSpec> {
        if other > self {
            return Err(Error::Overflow);
        }
        Ok(TimeSpec::new(self.sec - other.sec, self.nsec - other.nsec))
    }

    /// `self - other`, clamped at zero.
    pub fn saturating_sub(self, other: TimeSpec) -> TimeSpec {
        self.checked_sub(other).unwrap_or(TimeSpec::ZERO)
    }

    /// True when `self` is at or before `now`.
    pub fn is_past(&self, now: TimeSpec) -> bool {
        *self <= now
    }

    pub fn as_nanos(&self) -> i128 {
        self.sec as i128 * NANOS_PER_SEC as i128 + self.nsec as i128
    }

    pub fn from_nanos(ns: i128) -> TimeSpec {
        TimeSpec::new((ns / NANOS_PER_SEC as i128) as i64, (ns % NANOS_PER_SEC as i128) as i64)
    }

    /// Lossless for the non-negative values this crate produces.
    pub fn to_duration(&self) -> Duration {
        Duration::new(self.sec.max(0) as u64, self.nsec as u32)
    }

    pub fn as_libc(&self) -> libc::timespec {
        libc::timespec { tv_sec: self.sec as libc::time_t, tv_nsec: self.nsec as libc::c_long }
    }
}

impl From<Duration> for TimeSpec {
    fn from(d: Duration) -> TimeSpec {
        TimeSpec::new(d.as_secs() as i64, d.subsec_nanos() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes_carry() {
        let t = TimeSpec::new(1, 1_500_000_000);
        assert_eq!(t.sec(), 2);
        assert_eq!(t.nsec(), 500_000_000);

        let t = TimeSpec::new(2, -500_000_000);
        assert_eq!(t.sec(), 1);
        assert_eq!(t.nsec(), 500_000_000);

        let t = TimeSpec::new(0, -2_100_000_000);
        assert_eq!(t.sec(), -3);
        assert_eq!(t.nsec(), 900_000_000);
    }

    #[test]
    fn test_add_carries() {
        let a = TimeSpec::new(1, 700_000_000);
        let b = TimeSpec::new(2, 600_000_000);
        let c = a.checked_add(b);
        assert_eq!(c.sec(), 4);
        assert_eq!(c.nsec(), 300_000_000);
    }

    #[test]
    fn test_sub_borrows_and_overflows() {
        let a = TimeSpec::new(3, 100_000_000);
        let b = TimeSpec::new(1, 600_000_000);
        let c = a.checked_sub(b).unwrap();
        assert_eq!(c.sec(), 1);
        assert_eq!(c.nsec(), 500_000_000);

        assert!(matches!(b.checked_sub(a), Err(Error::Overflow)));
        assert_eq!(b.saturating_sub(a), TimeSpec::ZERO);
    }

    #[test]
    fn test_ordering() {
        let a = TimeSpec::new(1, 999_999_999);
        let b = TimeSpec::new(2, 0);
        assert!(a < b);
        assert!(a.is_past(b));
        assert!(!b.is_past(a));
        assert!(a.is_past(a));
    }

    #[test]
    fn test_duration_round_trip() {
        let d = Duration::new(5, 250_000_000);
        let t = TimeSpec::from(d);
        assert_eq!(t.to_duration(), d);
        assert_eq!(t.as_nanos(), 5_250_000_000);
        assert_eq!(TimeSpec::from_nanos(5_250_000_000), t);
    }

    #[test]
    fn test_monotonic_advances() {
        let a = TimeSpec::now_monotonic();
        let b = TimeSpec::now_monotonic();
        assert!(a <= b);
    }
}
