//! Tumbling-window counting with finalize-once semantics.
//!
//! A window `[start, start + size)` stays open while its end is above the
//! watermark. Once `end <= watermark` it is emitted a single time and
//! forgotten; events for it that arrive afterwards are dropped as late and
//! never reopen it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Accepted,
    /// The event's window was already past finalization
    Late,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowAccumulator {
    pub stream_id: String,
    pub group_key: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub count: u64,
}

/// Open windows at a point in time, ordered by (window_start, group_key)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub windows: Vec<WindowAccumulator>,
}

#[derive(Debug, Clone)]
pub struct WindowedAggregator {
    stream_id: String,
    size_ms: i64,
    // (window_start, group_key) -> count
    open: BTreeMap<(DateTime<Utc>, String), u64>,
}

impl WindowedAggregator {
    pub fn new(stream_id: impl Into<String>, window: Duration) -> Self {
        Self {
            stream_id: stream_id.into(),
            size_ms: (window.as_millis() as i64).max(1),
            open: BTreeMap::new(),
        }
    }

    /// Start of the epoch-aligned window containing `event_time`
    pub fn window_start(&self, event_time: DateTime<Utc>) -> DateTime<Utc> {
        let ms = event_time.timestamp_millis();
        let start = ms - ms.rem_euclid(self.size_ms);
        DateTime::from_timestamp_millis(start).unwrap_or(event_time)
    }

    fn window_end(&self, window_start: DateTime<Utc>) -> DateTime<Utc> {
        window_start + chrono::Duration::milliseconds(self.size_ms)
    }

    pub fn add(
        &mut self,
        group_key: &str,
        event_time: DateTime<Utc>,
        watermark: Option<DateTime<Utc>>,
    ) -> AddOutcome {
        let start = self.window_start(event_time);
        if let Some(watermark) = watermark {
            if self.window_end(start) <= watermark {
                return AddOutcome::Late;
            }
        }

        *self.open.entry((start, group_key.to_string())).or_insert(0) += 1;
        AddOutcome::Accepted
    }

    /// Finalize and remove every window whose end is at or below the watermark
    pub fn advance(&mut self, watermark: Option<DateTime<Utc>>) -> Vec<WindowAccumulator> {
        let Some(watermark) = watermark else {
            return Vec::new();
        };

        let ready: Vec<(DateTime<Utc>, String)> = self
            .open
            .keys()
            .filter(|(start, _)| self.window_end(*start) <= watermark)
            .cloned()
            .collect();

        ready
            .into_iter()
            .filter_map(|key| {
                let count = self.open.remove(&key)?;
                let (window_start, group_key) = key;
                Some(WindowAccumulator {
                    stream_id: self.stream_id.clone(),
                    group_key,
                    window_start,
                    window_end: self.window_end(window_start),
                    count,
                })
            })
            .collect()
    }

    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            windows: self
                .open
                .iter()
                .map(|((start, group_key), count)| WindowAccumulator {
                    stream_id: self.stream_id.clone(),
                    group_key: group_key.clone(),
                    window_start: *start,
                    window_end: self.window_end(*start),
                    count: *count,
                })
                .collect(),
        }
    }

    pub fn restore(&mut self, snapshot: &WindowSnapshot) {
        self.open = snapshot
            .windows
            .iter()
            .map(|w| ((w.window_start, w.group_key.clone()), w.count))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn minute() -> WindowedAggregator {
        WindowedAggregator::new("clickstream", Duration::from_secs(60))
    }

    #[test]
    fn test_window_alignment() {
        let agg = minute();
        assert_eq!(agg.window_start(t(100)), t(60));
        assert_eq!(agg.window_start(t(60)), t(60));
        assert_eq!(agg.window_start(t(59)), t(0));
        assert_eq!(agg.window_start(t(-1)), t(-60));
    }

    #[test]
    fn test_not_finalized_before_watermark_crosses_end() {
        let mut agg = minute();
        agg.add("/home", t(100), None);
        agg.add("/home", t(110), None);

        assert!(agg.advance(None).is_empty());
        assert!(agg.advance(Some(t(119))).is_empty());

        let done = agg.advance(Some(t(120)));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].window_start, t(60));
        assert_eq!(done[0].window_end, t(120));
        assert_eq!(done[0].count, 2);
    }

    #[test]
    fn test_finalized_exactly_once() {
        let mut agg = minute();
        agg.add("/home", t(100), None);

        assert_eq!(agg.advance(Some(t(200))).len(), 1);
        assert!(agg.advance(Some(t(200))).is_empty());
        assert!(agg.advance(Some(t(500))).is_empty());

        // Late event for the finalized window does not reopen it.
        assert_eq!(agg.add("/home", t(100), Some(t(200))), AddOutcome::Late);
        assert_eq!(agg.open_windows(), 0);
    }

    #[test]
    fn test_emission_order_is_deterministic() {
        let mut agg = minute();
        agg.add("/search", t(61), None);
        agg.add("/cart", t(1), None);
        agg.add("/home", t(62), None);
        agg.add("/about", t(63), None);

        let done = agg.advance(Some(t(180)));
        let keys: Vec<(i64, &str)> = done
            .iter()
            .map(|w| (w.window_start.timestamp(), w.group_key.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![(0, "/cart"), (60, "/about"), (60, "/home"), (60, "/search")]
        );
    }

    #[test]
    fn test_window_open_while_end_above_watermark() {
        let mut agg = minute();
        assert_eq!(agg.add("/home", t(30), Some(t(40))), AddOutcome::Accepted);
        assert_eq!(agg.add("/home", t(30), Some(t(60))), AddOutcome::Late);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut agg = minute();
        agg.add("/home", t(100), None);
        agg.add("/cart", t(130), None);

        let snapshot = agg.snapshot();
        let mut restored = minute();
        restored.restore(&snapshot);
        assert_eq!(restored.open_windows(), 2);

        let done = restored.advance(Some(t(180)));
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].group_key, "/home");
    }
}
