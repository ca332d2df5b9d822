use super::{saturating_sub, to_delta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Checkpointed form of the tracker state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkSnapshot {
    pub max_event_time: BTreeMap<String, DateTime<Utc>>,
}

/// Tracks a monotonic low-watermark per logical stream.
///
/// The watermark is `max(event_time observed) - lateness`. Only the maximum
/// is tracked, so an old event arriving late never moves it backwards, and a
/// stream without traffic keeps its last value.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    lateness: chrono::Duration,
    max_event_time: BTreeMap<String, DateTime<Utc>>,
}

impl WatermarkTracker {
    pub fn new(lateness: Duration) -> Self {
        Self {
            lateness: to_delta(lateness),
            max_event_time: BTreeMap::new(),
        }
    }

    /// Record an event time. Returns true if the watermark advanced.
    pub fn observe(&mut self, stream_id: &str, event_time: DateTime<Utc>) -> bool {
        match self.max_event_time.get_mut(stream_id) {
            Some(max) if *max >= event_time => false,
            Some(max) => {
                *max = event_time;
                true
            }
            None => {
                self.max_event_time.insert(stream_id.to_string(), event_time);
                true
            }
        }
    }

    /// Current watermark, or `None` before the first observed event
    pub fn watermark(&self, stream_id: &str) -> Option<DateTime<Utc>> {
        self.max_event_time
            .get(stream_id)
            .map(|max| saturating_sub(*max, self.lateness))
    }

    pub fn max_event_time(&self, stream_id: &str) -> Option<DateTime<Utc>> {
        self.max_event_time.get(stream_id).copied()
    }

    pub fn snapshot(&self) -> WatermarkSnapshot {
        WatermarkSnapshot {
            max_event_time: self.max_event_time.clone(),
        }
    }

    /// Merge a snapshot. Restoring can raise but never lower a tracked maximum.
    pub fn restore(&mut self, snapshot: &WatermarkSnapshot) {
        for (stream_id, time) in &snapshot.max_event_time {
            self.observe(stream_id, *time);
        }
    }
}
