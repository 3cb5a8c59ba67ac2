use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// On-disk form of a cached value: `{ "data": .., "timestamp": <unix ms> }`.
///
/// `tags` was added after the first format and is optional on read, so
/// records from older builds still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRecord<T> {
    pub data: T,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl<T> PersistedRecord<T> {
    pub fn new(data: T, tags: Vec<String>) -> Self {
        Self {
            data,
            timestamp: Utc::now().timestamp_millis(),
            tags,
        }
    }

    /// Age in milliseconds; negative ages (clock skew) count as zero.
    pub fn age_ms(&self) -> u64 {
        (Utc::now().timestamp_millis() - self.timestamp).max(0) as u64
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(self.age_ms())
    }

    pub fn age_minutes(&self) -> i64 {
        (self.age_ms() / 60_000) as i64
    }

    /// Coarse human age: "just now", "5m ago", "2h ago", "3d ago".
    /// Hours and days round half up.
    pub fn age_display(&self) -> String {
        const HOUR: i64 = 60;
        const DAY: i64 = 24 * HOUR;

        match self.age_minutes() {
            m if m < 1 => "just now".to_string(),
            m if m < HOUR => format!("{}m ago", m),
            m if m < DAY => format!("{}h ago", (m + HOUR / 2) / HOUR),
            m => format!("{}d ago", (m + DAY / 2) / DAY),
        }
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        u128::from(self.age_ms()) < ttl.as_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aged(minutes: i64) -> PersistedRecord<u8> {
        let mut record = PersistedRecord::new(0, Vec::new());
        record.timestamp -= minutes * 60_000;
        record
    }

    #[test]
    fn test_age_display() {
        assert_eq!(aged(0).age_display(), "just now");
        assert_eq!(aged(5).age_display(), "5m ago");
        assert_eq!(aged(60 + 10).age_display(), "1h ago");
        assert_eq!(aged(60 + 40).age_display(), "2h ago");
        assert_eq!(aged(1440 + 60).age_display(), "1d ago");
        assert_eq!(aged(1440 + 13 * 60).age_display(), "2d ago");
    }

    #[test]
    fn test_future_timestamp_reads_as_just_now() {
        let mut record = PersistedRecord::new(0u8, Vec::new());
        record.timestamp += 60_000;
        assert_eq!(record.age_ms(), 0);
        assert_eq!(record.age_display(), "just now");
    }

    #[test]
    fn test_freshness() {
        let record = aged(3);
        assert!(record.is_fresh(Duration::from_secs(5 * 60)));
        assert!(!record.is_fresh(Duration::from_secs(2 * 60)));
        assert!(!PersistedRecord::new(0u8, Vec::new()).is_fresh(Duration::ZERO));
    }

    #[test]
    fn test_parses_record_without_tags() {
        let json = r#"{"data": [{"id": 1}], "timestamp": 1700000000000}"#;
        let record: PersistedRecord<serde_json::Value> = serde_json::from_str(json).unwrap();
        assert!(record.tags.is_empty());
        assert_eq!(record.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_serialized_shape() {
        let record = PersistedRecord {
            data: vec![1, 2],
            timestamp: 42,
            tags: Vec::new(),
        };
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"data":[1,2],"timestamp":42}"#
        );
    }
}
