use std::{
    ops::{Add, AddAssign, Sub, SubAssign},
    str::FromStr,
};

use chrono::Utc;
use humantime::{Duration as HumanDuration, DurationError as HumanDurationError};

use crate::clock::wall_clock;

/// Nanos since unix epoch, good till 2554 or so.
///
/// Also used for durations; the arithmetic is the same and the agent never
/// needs a separate type for the two.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq)]
#[repr(C)]
pub struct Nanos(pub u64);

impl Nanos {
    pub const MAX: Nanos = Nanos(u64::MAX);
    pub const ZERO: Nanos = Nanos(0);

    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Nanos(s * 1_000_000_000)
    }

    #[inline]
    pub fn from_secs_f64(s: f64) -> Self {
        Nanos((s * 1_000_000_000.0).round() as u64)
    }

    #[inline]
    pub const fn from_millis(s: u64) -> Self {
        Nanos(s * 1_000_000)
    }

    #[inline]
    pub const fn from_micros(s: u64) -> Self {
        Nanos(s * 1_000)
    }

    #[inline]
    pub fn as_secs(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    #[inline]
    pub const fn as_secs_u64(&self) -> u64 {
        self.0 / 1_000_000_000
    }

    #[inline]
    pub const fn as_millis_u64(&self) -> u64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub const fn subsec_nanos(&self) -> u64 {
        self.0 % 1_000_000_000
    }

    #[inline]
    pub fn now() -> Self {
        wall_clock().now()
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Nanos) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub fn elapsed_since(&self, since: Self) -> Self {
        Nanos(self.0.saturating_sub(since.0))
    }

    pub fn with_fmt_utc(&self, fmt: &str) -> String {
        chrono::DateTime::<Utc>::from(*self).format(fmt).to_string()
    }
}

impl From<Nanos> for chrono::DateTime<Utc> {
    fn from(value: Nanos) -> Self {
        chrono::DateTime::from_timestamp_nanos(value.0 as i64)
    }
}

impl std::fmt::Display for Nanos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self < Nanos::from_micros(1) {
            write!(f, "{}ns", self.0)
        } else if *self < Nanos::from_millis(1) {
            write!(f, "{}μs", self.0 as f64 / 1000.0)
        } else if *self < Nanos::from_secs(1) {
            write!(f, "{}ms", (self.0 / 1000) as f64 / 1000.0)
        } else {
            write!(f, "{}s", (self.0 / 1_000_000) as f64 / 1000.0)
        }
    }
}

impl From<u64> for Nanos {
    #[inline]
    fn from(value: u64) -> Self {
        Nanos(value)
    }
}

impl From<Nanos> for u64 {
    #[inline]
    fn from(value: Nanos) -> Self {
        value.0
    }
}

impl Add for Nanos {
    type Output = Nanos;

    #[inline]
    fn add(self, rhs: Nanos) -> Nanos {
        Nanos(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Nanos {
    #[inline]
    fn add_assign(&mut self, rhs: Nanos) {
        *self = *self + rhs;
    }
}

impl Sub for Nanos {
    type Output = Nanos;

    #[inline]
    fn sub(self, rhs: Nanos) -> Nanos {
        Nanos(self.0 - rhs.0)
    }
}

impl SubAssign for Nanos {
    #[inline]
    fn sub_assign(&mut self, rhs: Nanos) {
        *self = *self - rhs;
    }
}

impl PartialOrd for Nanos {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Nanos {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl From<Nanos> for std::time::Duration {
    #[inline]
    fn from(value: Nanos) -> Self {
        std::time::Duration::from_nanos(value.0)
    }
}

impl FromStr for Nanos {
    type Err = HumanDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<HumanDuration>() {
            Ok(duration) => {
                let std_duration: std::time::Duration = duration.into();
                Ok(Nanos(std_duration.as_nanos() as u64))
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nanos_from_string_seconds() {
        let result: Nanos = "10s".parse().unwrap();
        assert_eq!(result, Nanos::from_secs(10));
    }

    #[test]
    fn test_nanos_from_string_milliseconds() {
        let result: Nanos = "40ms".parse().unwrap();
        assert_eq!(result, Nanos::from_millis(40));
    }

    #[test]
    fn test_saturating_sub_floors_at_zero() {
        assert_eq!(Nanos::from_secs(1).saturating_sub(Nanos::from_secs(2)), Nanos::ZERO);
    }

    #[test]
    fn test_subsec_split() {
        let t = Nanos::from_secs(3) + Nanos::from_millis(250);
        assert_eq!(t.as_secs_u64(), 3);
        assert_eq!(t.subsec_nanos(), 250_000_000);
    }
}
