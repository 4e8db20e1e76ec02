//! Time utilities for custodian
//!
//! Wall-clock time is only used for display (last evaluation, last action).
//! Every decision about debounce, throttling and deadlines uses monotonic time.

use chrono::{DateTime, Local};
use std::time::Duration;

/// Get the current local time.
#[allow(clippy::disallowed_methods)] // The single wrapper around Local::now()
pub fn now() -> DateTime<Local> {
    chrono::Local::now()
}

/// Format a DateTime with full date and time.
pub fn format_datetime_full(dt: &DateTime<Local>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Convert a (possibly fractional) number of seconds into a Duration.
///
/// Negative and non-finite values collapse to zero.
pub fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

/// Render a duration the way log lines and the CLI show it ("2.5s", "90s").
pub fn format_seconds(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{:.1}s", secs)
    }
}
