//! Rate calculation for the GCRA algorithm
//!
//! This module provides the [`Rate`] type which represents emission intervals,
//! the [`Period`] units accepted in configuration, and the [`Quota`] that pairs
//! a rate with a burst allowance.

use super::CellError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;


/// Time unit of a configured rate
///
/// Parsed from the single-letter codes used in configuration:
/// `s` (second), `i` (minute), `h` (hour) and `d` (day). Anything else is
/// rejected with [`CellError::UnknownPeriod`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Second,
    Minute,
    Hour,
    Day,
}

impl Period {
    /// Length of the period
    pub fn duration(self) -> Duration {
        match self {
            Period::Second => Duration::from_secs(1),
            Period::Minute => Duration::from_secs(60),
            Period::Hour => Duration::from_secs(3600),
            Period::Day => Duration::from_secs(86_400),
        }
    }

    /// Configuration code of the period
    pub fn code(self) -> char {
        match self {
            Period::Second => 's',
            Period::Minute => 'i',
            Period::Hour => 'h',
            Period::Day => 'd',
        }
    }
}

impl FromStr for Period {
    type Err = CellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "s" | "S" => Ok(Period::Second),
            "i" | "I" => Ok(Period::Minute),
            "h" | "H" => Ok(Period::Hour),
            "d" | "D" => Ok(Period::Day),
            other => Err(CellError::UnknownPeriod(other.to_string())),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Rate defines the emission interval for the rate limiter
///
/// The `Rate` type encapsulates "N requests per time period" as the duration
/// between two token emissions.
///
/// # Examples
///
/// ```
/// use scopecrab::Rate;
/// use std::time::Duration;
///
/// // 10 requests per second
/// let rate = Rate::per_second(10);
/// assert_eq!(rate.period(), Duration::from_millis(100));
///
/// // 60 requests per minute (1 per second)
/// let rate = Rate::per_minute(60);
/// assert_eq!(rate.period(), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    period: Duration,
}

impl Rate {
    /// Creates a new rate with a custom period between token emissions
    pub fn new(period: Duration) -> Self {
        Rate { period }
    }

    /// Creates a rate of n requests per second
    pub fn per_second(n: u64) -> Self {
        Self::per(Period::Second, n)
    }

    /// Creates a rate of n requests per minute
    pub fn per_minute(n: u64) -> Self {
        Self::per(Period::Minute, n)
    }

    /// Creates a rate of n requests per hour
    pub fn per_hour(n: u64) -> Self {
        Self::per(Period::Hour, n)
    }

    /// Creates a rate of n requests per day
    pub fn per_day(n: u64) -> Self {
        Self::per(Period::Day, n)
    }

    /// Creates a rate of `n` requests per `period`
    ///
    /// A zero `n` yields a rate that never emits, which blocks every request.
    pub fn per(period: Period, n: u64) -> Self {
        if n == 0 {
            return Rate {
                period: Duration::MAX,
            };
        }

        let nanos = period.duration().as_nanos() / n as u128;
        Rate {
            period: Duration::from_nanos(nanos as u64),
        }
    }

    /// Returns the emission interval (period) of this rate
    pub fn period(&self) -> Duration {
        self.period
    }
}

/// A rate paired with its burst allowance
///
/// The burst is the number of requests a fresh key may make back to back.
/// A configured burst of `0` is treated the same as `1`: no requests beyond
/// the steady rate.
///
/// # Example
///
/// ```
/// use scopecrab::{Period, Quota};
/// use std::time::Duration;
///
/// let quota = Quota::new(1, Period::Minute, 3).unwrap();
/// assert_eq!(quota.max_burst(), 3);
/// assert_eq!(quota.emission_interval(), Duration::from_secs(60));
///
/// assert!(Quota::new(0, Period::Minute, 3).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    requests: u64,
    period: Period,
    rate: Rate,
    max_burst: u32,
}

impl Quota {
    /// Validate and build a quota from its configured parts
    ///
    /// # Errors
    ///
    /// [`CellError::InvalidRateLimit`] if `requests <= 0`, `burst < 0`, or
    /// `burst` does not fit in a `u32`.
    pub fn new(requests: i64, period: Period, burst: i64) -> Result<Self, CellError> {
        if requests <= 0 {
            return Err(CellError::InvalidRateLimit(format!(
                "requests must be positive, got {requests}"
            )));
        }
        if burst < 0 {
            return Err(CellError::InvalidRateLimit(format!(
                "burst must not be negative, got {burst}"
            )));
        }
        let burst = u32::try_from(burst)
            .map_err(|_| CellError::InvalidRateLimit(format!("burst {burst} is too large")))?;

        Ok(Quota {
            requests: requests as u64,
            period,
            rate: Rate::per(period, requests as u64),
            max_burst: burst.max(1),
        })
    }

    /// Parse the period code and build the quota in one step
    pub fn parse(requests: i64, period: &str, burst: i64) -> Result<Self, CellError> {
        Self::new(requests, period.parse()?, burst)
    }

    /// Number of requests per period
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// The configured period unit
    pub fn period(&self) -> Period {
        self.period
    }

    /// Requests a fresh key may make back to back (always at least 1)
    pub fn max_burst(&self) -> u32 {
        self.max_burst
    }

    /// Steady-state time between admissible requests
    pub fn emission_interval(&self) -> Duration {
        self.rate.period()
    }

    /// How far ahead of `now` the theoretical arrival time may run
    pub fn delay_variation_tolerance(&self) -> Duration {
        self.rate.period().saturating_mul(self.max_burst - 1)
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} burst {}",
            self.requests, self.period, self.max_burst
        )
    }
}
