//! Streaming Types
//!
//! Core domain types shared by every stage of the pipeline: stream types,
//! bus events, topic patterns and the outbound envelope.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Stream Type
// =============================================================================

/// Logical channel grouping subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    /// Prices, tickers and candles.
    MarketData,
    /// Technical indicator values.
    Indicators,
    /// Strategy trading signals.
    Signals,
    /// Order lifecycle updates.
    Orders,
    /// Portfolio and position snapshots.
    Portfolio,
    /// Execution session progress snapshots.
    ExecutionProgress,
    /// Execution session terminal results.
    ExecutionResult,
    /// Platform status notices.
    SystemStatus,
}

impl StreamType {
    /// Get all stream types.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::MarketData,
            Self::Indicators,
            Self::Signals,
            Self::Orders,
            Self::Portfolio,
            Self::ExecutionProgress,
            Self::ExecutionResult,
            Self::SystemStatus,
        ]
    }

    /// Wire name of the stream.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::Indicators => "indicators",
            Self::Signals => "signals",
            Self::Orders => "orders",
            Self::Portfolio => "portfolio",
            Self::ExecutionProgress => "execution_progress",
            Self::ExecutionResult => "execution_result",
            Self::SystemStatus => "system_status",
        }
    }

    /// Payload fields that must be present before a message is enqueued.
    #[must_use]
    pub const fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::MarketData => &["symbol"],
            Self::Indicators => &["symbol", "indicator_type"],
            Self::Signals => &["symbol", "signal_type"],
            Self::Orders => &["order_id"],
            Self::ExecutionProgress | Self::ExecutionResult => &["session_id"],
            Self::Portfolio | Self::SystemStatus => &[],
        }
    }

    /// Whether this stream carries session execution state.
    #[must_use]
    pub const fn is_execution(self) -> bool {
        matches!(self, Self::ExecutionProgress | Self::ExecutionResult)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stream name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stream type: {0}")]
pub struct UnknownStreamType(pub String);

impl FromStr for StreamType {
    type Err = UnknownStreamType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Self::all()
            .iter()
            .copied()
            .find(|stream| stream.as_str() == normalized)
            .ok_or_else(|| UnknownStreamType(s.to_string()))
    }
}

// =============================================================================
// Bus Event
// =============================================================================

/// An ephemeral event taken off the bus. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Topic the event was published on.
    pub topic: String,
    /// Event payload.
    pub payload: Value,
    /// When the publisher handed the event to the bus.
    pub publish_time: DateTime<Utc>,
}

impl Event {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn now(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            publish_time: Utc::now(),
        }
    }

    /// Time elapsed since the event was published.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        (Utc::now() - self.publish_time)
            .to_std()
            .unwrap_or_default()
    }
}

// =============================================================================
// Topic Pattern
// =============================================================================

/// Dot-separated topic pattern.
///
/// `*` matches exactly one segment and a trailing `**` matches zero or more
/// trailing segments. Every other segment matches literally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<String>,
}

impl TopicPattern {
    /// Parse a pattern.
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let segments = raw.split('.').map(str::to_string).collect();
        Self { raw, segments }
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check whether `topic` matches this pattern.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split('.').collect();
        let mut i = 0;

        for (idx, segment) in self.segments.iter().enumerate() {
            if segment == "**" && idx == self.segments.len() - 1 {
                return true;
            }
            let Some(part) = parts.get(i) else {
                return false;
            };
            if segment != "*" && segment != part {
                return false;
            }
            i += 1;
        }

        i == parts.len()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Standard outbound wrapper around every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type (`price_update`, `batch`, `execution_progress`, ...).
    #[serde(rename = "type")]
    pub message_type: String,
    /// Stream the message belongs to.
    pub stream: StreamType,
    /// When the envelope was built.
    pub timestamp: DateTime<Utc>,
    /// Batch identifier for batched messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Number of items in a batched message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Payload. An array of items for batches.
    pub data: Value,
}

impl Envelope {
    /// Message type used for batched envelopes.
    pub const BATCH_TYPE: &'static str = "batch";

    /// Wrap a single payload.
    #[must_use]
    pub fn single(stream: StreamType, message_type: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            stream,
            timestamp: Utc::now(),
            batch_id: None,
            batch_size: None,
            data,
        }
    }

    /// Wrap a batch of payloads.
    #[must_use]
    pub fn batch(stream: StreamType, batch_id: impl Into<String>, items: Vec<Value>) -> Self {
        Self {
            message_type: Self::BATCH_TYPE.to_string(),
            stream,
            timestamp: Utc::now(),
            batch_id: Some(batch_id.into()),
            batch_size: Some(items.len()),
            data: Value::Array(items),
        }
    }

    /// Whether this envelope carries a batch.
    #[must_use]
    pub const fn is_batch(&self) -> bool {
        self.batch_id.is_some()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test]
    fn stream_type_round_trips_through_str() {
        for stream in StreamType::all() {
            assert_eq!(stream.as_str().parse::<StreamType>().unwrap(), *stream);
        }
    }

    #[test]
    fn stream_type_parse_is_case_insensitive() {
        assert_eq!(
            "MARKET_DATA".parse::<StreamType>().unwrap(),
            StreamType::MarketData
        );
        assert!("quotes".parse::<StreamType>().is_err());
    }

    #[test_case("market.price", "market.price", true ; "exact")]
    #[test_case("market.*", "market.price", true ; "single wildcard")]
    #[test_case("market.*", "market.price.btc", false ; "single wildcard one segment only")]
    #[test_case("market.**", "market", true ; "double wildcard zero segments")]
    #[test_case("market.**", "market.price.btc", true ; "double wildcard many segments")]
    #[test_case("*.updated", "indicator.updated", true ; "leading wildcard")]
    #[test_case("indicator.updated", "indicator.created", false ; "literal mismatch")]
    #[test_case("indicator", "indicator.updated", false ; "pattern shorter than topic")]
    fn topic_pattern_matching(pattern: &str, topic: &str, expected: bool) {
        assert_eq!(TopicPattern::new(pattern).matches(topic), expected);
    }

    #[test]
    fn envelope_serializes_wire_shape() {
        let envelope = Envelope::single(
            StreamType::MarketData,
            "price_update",
            json!({"symbol": "BTC_USDT"}),
        );
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "price_update");
        assert_eq!(value["stream"], "market_data");
        assert!(value.get("batch_id").is_none());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn batch_envelope_carries_size() {
        let envelope = Envelope::batch(
            StreamType::Indicators,
            "b-1",
            vec![json!({"symbol": "A"}), json!({"symbol": "B"})],
        );
        assert!(envelope.is_batch());
        assert_eq!(envelope.batch_size, Some(2));
        assert_eq!(envelope.message_type, "batch");
    }
}
