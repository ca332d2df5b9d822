//! Watermark-bounded deduplication.
//!
//! Keys are remembered with the event time of their first sighting and
//! forgotten once that time falls below `watermark - retention`. Any event at
//! or past that horizon is rejected as too late, so a forgotten key can never
//! be admitted a second time.

use crate::watermark::{saturating_sub, to_delta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sighting; the key is now recorded
    First,
    /// Key already recorded; drop the event
    Duplicate,
    /// Event is older than the retention horizon; neither recorded nor processed
    TooLate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub key: String,
    pub first_seen: DateTime<Utc>,
}

/// Checkpointed form of the store, sorted by key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupSnapshot {
    pub entries: Vec<DedupEntry>,
}

#[derive(Debug, Clone)]
pub struct DedupStore {
    retention: chrono::Duration,
    seen: HashMap<String, DateTime<Utc>>,
}

impl DedupStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention: to_delta(retention),
            seen: HashMap::new(),
        }
    }

    fn horizon(&self, watermark: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        watermark.map(|w| saturating_sub(w, self.retention))
    }

    pub fn check(
        &mut self,
        key: &str,
        event_time: DateTime<Utc>,
        watermark: Option<DateTime<Utc>>,
    ) -> DedupOutcome {
        if let Some(horizon) = self.horizon(watermark) {
            if event_time < horizon {
                return DedupOutcome::TooLate;
            }
        }

        if self.seen.contains_key(key) {
            return DedupOutcome::Duplicate;
        }

        self.seen.insert(key.to_string(), event_time);
        DedupOutcome::First
    }

    /// Purge entries below the retention horizon. Returns the number removed.
    pub fn evict(&mut self, watermark: Option<DateTime<Utc>>) -> usize {
        let Some(horizon) = self.horizon(watermark) else {
            return 0;
        };
        let before = self.seen.len();
        self.seen.retain(|_, first_seen| *first_seen >= horizon);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn snapshot(&self) -> DedupSnapshot {
        let mut entries: Vec<DedupEntry> = self
            .seen
            .iter()
            .map(|(key, first_seen)| DedupEntry {
                key: key.clone(),
                first_seen: *first_seen,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        DedupSnapshot { entries }
    }

    pub fn restore(&mut self, snapshot: &DedupSnapshot) {
        self.seen = snapshot
            .entries
            .iter()
            .map(|e| (e.key.clone(), e.first_seen))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_duplicates_counted_once() {
        let mut store = DedupStore::new(Duration::ZERO);
        assert_eq!(store.check("A", t(100), None), DedupOutcome::First);
        for _ in 0..5 {
            assert_eq!(store.check("A", t(100), None), DedupOutcome::Duplicate);
        }
        assert_eq!(store.check("B", t(100), None), DedupOutcome::First);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_too_late_is_not_recorded() {
        let mut store = DedupStore::new(Duration::ZERO);
        assert_eq!(store.check("C", t(30), Some(t(40))), DedupOutcome::TooLate);
        assert!(store.is_empty());
        // Exactly at the horizon is still accepted.
        assert_eq!(store.check("D", t(40), Some(t(40))), DedupOutcome::First);
    }

    #[test]
    fn test_retention_extends_horizon() {
        let mut store = DedupStore::new(Duration::from_secs(20));
        assert_eq!(store.check("C", t(30), Some(t(40))), DedupOutcome::First);
        assert_eq!(store.check("E", t(10), Some(t(40))), DedupOutcome::TooLate);
    }

    #[test]
    fn test_eviction_follows_watermark() {
        let mut store = DedupStore::new(Duration::ZERO);
        store.check("old", t(10), None);
        store.check("new", t(100), None);

        assert_eq!(store.evict(None), 0);
        assert_eq!(store.evict(Some(t(50))), 1);
        assert_eq!(store.len(), 1);

        // A duplicate of an evicted key is rejected as too late, never re-admitted.
        assert_eq!(store.check("old", t(10), Some(t(50))), DedupOutcome::TooLate);
        assert_eq!(store.check("new", t(100), Some(t(50))), DedupOutcome::Duplicate);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut store = DedupStore::new(Duration::ZERO);
        store.check("b", t(2), None);
        store.check("a", t(1), None);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.entries[0].key, "a");

        let mut restored = DedupStore::new(Duration::ZERO);
        restored.restore(&snapshot);
        assert_eq!(restored.check("a", t(1), None), DedupOutcome::Duplicate);
        assert_eq!(restored.snapshot(), snapshot);
    }
}
