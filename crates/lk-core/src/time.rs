//! Time utilities for leasekeeper
//!
//! Conversions between `std::time::Duration` (configuration, timers) and
//! `chrono` (token timestamps), plus compact human formatting for logs.

use chrono::TimeDelta;
use std::time::Duration;

/// Convert a std duration to a chrono delta, saturating at the chrono maximum
pub fn to_chrono(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Convert a chrono delta to a std duration; negative deltas become zero
pub fn to_std(delta: TimeDelta) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

/// Format a duration as `1h2m3s`, dropping zero components.
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use lk_core::time::format_duration;
///
/// assert_eq!(format_duration(Duration::from_secs(3725)), "1h2m5s");
/// assert_eq!(format_duration(Duration::ZERO), "0s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    if total == 0 {
        return "0s".to_string();
    }

    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 {
        out.push_str(&format!("{}s", seconds));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_conversion() {
        let d = Duration::from_secs(90);
        assert_eq!(to_std(to_chrono(d)), d);
    }

    #[test]
    fn test_negative_delta_is_zero() {
        assert_eq!(to_std(TimeDelta::seconds(-5)), Duration::ZERO);
    }

    #[test]
    fn test_to_chrono_saturates() {
        assert_eq!(to_chrono(Duration::MAX), TimeDelta::MAX);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h1m1s");
    }
}
