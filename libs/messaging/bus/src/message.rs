//! Protocol-agnostic bus message

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum message size in bytes (16MB default)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Header stamped on dead-lettered messages: the topic they failed on.
pub const HEADER_ORIGINAL_TOPIC: &str = "original_topic";
/// Header stamped on dead-lettered messages: the final handler error.
pub const HEADER_ERROR: &str = "error";
/// Header stamped on dead-lettered messages: how many retries were burned.
pub const HEADER_RETRY_COUNT: &str = "retry_count";

/// One message in flight on the bus.
///
/// Ordering is guaranteed per `key` within a topic: two messages with the
/// same key land on the same partition and are handled in publish order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Destination topic
    pub topic: String,
    /// Partitioning key
    pub key: String,
    /// Raw message bytes (typically a serialized envelope)
    pub payload: Vec<u8>,
    /// Routing and dead-letter headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Publish time, nanoseconds since epoch
    pub timestamp_ns: u64,
}

impl BusMessage {
    /// Create a message for `topic` keyed by `key`.
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            headers: BTreeMap::new(),
            timestamp_ns: now_ns(),
        }
    }

    /// Attach a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Message size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Whether this message already came off a dead-letter topic.
    pub fn is_dead_letter(&self) -> bool {
        self.headers.contains_key(HEADER_ORIGINAL_TOPIC)
    }

    /// Build the dead-letter copy of this message for `dlq_topic`.
    pub fn into_dead_letter(self, dlq_topic: &str, error: &str, retry_count: u32) -> Self {
        let mut dead = Self {
            topic: dlq_topic.to_string(),
            key: self.key,
            payload: self.payload,
            headers: self.headers,
            timestamp_ns: now_ns(),
        };
        dead.headers
            .insert(HEADER_ORIGINAL_TOPIC.to_string(), self.topic);
        dead.headers.insert(HEADER_ERROR.to_string(), error.to_string());
        dead.headers
            .insert(HEADER_RETRY_COUNT.to_string(), retry_count.to_string());
        dead
    }
}

fn now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_carries_required_headers() {
        let msg = BusMessage::new("trades", "BTCUSD", b"tick".to_vec());
        let dead = msg.into_dead_letter("dlq", "handler exploded", 3);

        assert_eq!(dead.topic, "dlq");
        assert_eq!(dead.headers[HEADER_ORIGINAL_TOPIC], "trades");
        assert_eq!(dead.headers[HEADER_ERROR], "handler exploded");
        assert_eq!(dead.headers[HEADER_RETRY_COUNT], "3");
        assert!(dead.is_dead_letter());
        assert_eq!(dead.payload, b"tick");
    }

    #[test]
    fn frame_round_trip() {
        let msg = BusMessage::new("klines", "ETHUSD", vec![1, 2, 3])
            .with_header("source", "kraken");
        let json = serde_json::to_vec(&msg).unwrap();
        let back: BusMessage = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, msg);
    }
}
