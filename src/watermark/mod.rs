pub mod tracker;

pub use tracker::{WatermarkSnapshot, WatermarkTracker};

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Convert a config duration to a chrono delta, saturating on overflow
pub fn to_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `time - delta`, clamped to the earliest representable instant
pub fn saturating_sub(time: DateTime<Utc>, delta: chrono::Duration) -> DateTime<Utc> {
    time.checked_sub_signed(delta)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
