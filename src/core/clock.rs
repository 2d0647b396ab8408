//! # Clock
//!
//! Wall-clock source shared by the rate limiters, quotas and cache envelope
//! expiry. Production code uses [`SystemClock`]; tests drive window
//! boundaries with [`ManualClock`].

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use std::time::Duration;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Current time as unix milliseconds
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }

    /// Current time as unix seconds
    fn now_secs(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Clock backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Start at the given unix timestamp (seconds)
    pub fn at_unix(secs: i64) -> Self {
        let start = Utc
            .timestamp_opt(secs, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::new(start)
    }

    pub fn advance(&self, by: Duration) {
        let delta = ChronoDuration::from_std(by).unwrap_or_else(|_| ChronoDuration::zero());
        let mut current = self.current.lock();
        *current += delta;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.current.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_unix(1_700_000_000);
        assert_eq!(clock.now_secs(), 1_700_000_000);

        clock.advance(Duration::from_secs(61));
        assert_eq!(clock.now_secs(), 1_700_000_061);
        assert_eq!(clock.now_millis(), 1_700_000_061_000);
    }
}
