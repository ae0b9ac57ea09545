//! Wall-clock capability.
//!
//! Sessions read "now" through a [`Clock`] so ghost positions and the finish
//! grace window can be driven deterministically in tests.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> f64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> f64 {
        Utc::now().timestamp_millis() as f64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: f64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis.to_bits()),
        }
    }

    pub fn set(&self, millis: f64) {
        self.millis.store(millis.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, delta_millis: f64) {
        let now = self.now_millis();
        self.set(now + delta_millis);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> f64 {
        f64::from_bits(self.millis.load(Ordering::SeqCst))
    }
}

/// Render an epoch-millisecond timestamp as ISO-8601 (`2024-05-01T10:00:00.500Z`).
///
/// Sub-millisecond precision is rounded away. Returns `None` for values
/// outside chrono's representable range.
pub fn format_timestamp(millis: f64) -> Option<String> {
    if !millis.is_finite() {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(millis.round() as i64)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000.0);
        assert_eq!(clock.now_millis(), 1_000.0);
        clock.advance(500.5);
        assert_eq!(clock.now_millis(), 1_500.5);
        clock.set(42.0);
        assert_eq!(clock.now_millis(), 42.0);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_millis() > 1_577_836_800_000.0);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            format_timestamp(1_700_000_000_500.0).as_deref(),
            Some("2023-11-14T22:13:20.500Z")
        );
        assert_eq!(format_timestamp(0.4).as_deref(), Some("1970-01-01T00:00:00.000Z"));
        assert_eq!(format_timestamp(f64::NAN), None);
    }
}
