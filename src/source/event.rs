use crate::config::types::StreamKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("malformed {kind:?} payload: {source}")]
pub struct DecodeError {
    pub kind: StreamKind,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickEvent {
    pub event_id: String,
    pub user_id: String,
    pub url: String,
    #[serde(default)]
    pub referrer: String,
    #[serde(alias = "ua", default)]
    pub user_agent: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(alias = "ts")]
    pub event_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub device_id: String,
    pub site: String,
    pub temp_c: f64,
    pub humidity: f64,
    pub battery: f64,
    pub signal_strength: i32,
    #[serde(alias = "ts")]
    pub event_time: DateTime<Utc>,
}

/// A decoded event. Events are consumed by the pipeline and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Click(ClickEvent),
    Telemetry(TelemetryEvent),
}

impl Event {
    pub fn decode(kind: StreamKind, payload: &[u8]) -> Result<Self, DecodeError> {
        let result = match kind {
            StreamKind::Clickstream => serde_json::from_slice(payload).map(Event::Click),
            StreamKind::Telemetry => serde_json::from_slice(payload).map(Event::Telemetry),
        };
        result.map_err(|source| DecodeError { kind, source })
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        match self {
            Event::Click(e) => e.event_time,
            Event::Telemetry(e) => e.event_time,
        }
    }

    /// Producer-supplied uniqueness key used for deduplication.
    ///
    /// Telemetry has no event id, so a reading is identified by device and
    /// event time.
    pub fn dedup_key(&self) -> String {
        match self {
            Event::Click(e) => e.event_id.clone(),
            Event::Telemetry(e) => {
                format!("{}@{}", e.device_id, e.event_time.timestamp_micros())
            }
        }
    }

    /// Value of a string field by name, used for aggregation grouping
    pub fn field(&self, name: &str) -> Option<&str> {
        match self {
            Event::Click(e) => match name {
                "event_id" => Some(&e.event_id),
                "user_id" => Some(&e.user_id),
                "url" => Some(&e.url),
                "referrer" => Some(&e.referrer),
                "user_agent" => Some(&e.user_agent),
                "session_id" => e.session_id.as_deref(),
                _ => None,
            },
            Event::Telemetry(e) => match name {
                "device_id" => Some(&e.device_id),
                "site" => Some(&e.site),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_click_with_producer_aliases() {
        let payload = br#"{
            "event_id": "e-1",
            "user_id": "u00001",
            "url": "/home",
            "referrer": "https://example.com/",
            "ua": "Mozilla/5.0",
            "session_id": "s123456",
            "ts": "2025-01-01T00:01:40+00:00"
        }"#;

        let event = Event::decode(StreamKind::Clickstream, payload).unwrap();
        let Event::Click(click) = &event else {
            panic!("expected click event");
        };
        assert_eq!(click.user_agent, "Mozilla/5.0");
        assert_eq!(event.event_time().timestamp(), 1735689700);
        assert_eq!(event.dedup_key(), "e-1");
        assert_eq!(event.field("url"), Some("/home"));
        assert_eq!(event.field("session_id"), Some("s123456"));
    }

    #[test]
    fn test_decode_telemetry_key_includes_time() {
        let payload = br#"{
            "device_id": "d00042",
            "site": "Lisbon",
            "temp_c": 21.5,
            "humidity": 40.0,
            "battery": 88.1,
            "signal_strength": -67,
            "event_time": "2025-01-01T00:00:00Z"
        }"#;

        let event = Event::decode(StreamKind::Telemetry, payload).unwrap();
        assert_eq!(event.dedup_key(), "d00042@1735689600000000");
        assert_eq!(event.field("site"), Some("Lisbon"));
        assert_eq!(event.field("url"), None);
    }

    #[test]
    fn test_decode_wrong_kind_is_error() {
        let payload = br#"{"device_id": "d1"}"#;
        let err = Event::decode(StreamKind::Clickstream, payload).unwrap_err();
        assert_eq!(err.kind, StreamKind::Clickstream);
    }
}
