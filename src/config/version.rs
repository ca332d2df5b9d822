use super::types::StreamConfig;
use sha2::{Digest, Sha256};

/// Compute a deterministic fingerprint for a stream's configuration.
///
/// The fingerprint is stored with every checkpoint record so recovery can
/// tell when window or lateness settings changed underneath saved state.
pub fn stream_fingerprint(stream: &StreamConfig) -> String {
    // Struct fields serialize in declaration order, so the encoding is stable.
    let encoded = serde_json::to_vec(stream).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::*;
    use std::time::Duration;

    fn stream(lateness: u64) -> StreamConfig {
        StreamConfig {
            kind: StreamKind::Clickstream,
            topic: "clickstream".to_string(),
            table: "clickstream".to_string(),
            trigger: TriggerConfig::default(),
            watermark: WatermarkConfig {
                lateness: Duration::from_secs(lateness),
            },
            dedup: DedupConfig::default(),
            aggregation: None,
        }
    }

    #[test]
    fn test_same_config_same_fingerprint() {
        assert_eq!(stream_fingerprint(&stream(5)), stream_fingerprint(&stream(5)));
    }

    #[test]
    fn test_changed_config_changes_fingerprint() {
        assert_ne!(stream_fingerprint(&stream(5)), stream_fingerprint(&stream(6)));
        assert_eq!(stream_fingerprint(&stream(5)).len(), 64);
    }
}
