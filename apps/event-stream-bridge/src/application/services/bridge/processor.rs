//! Stream processors: topic patterns mapped onto an outbound stream.

use std::fmt;
use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::domain::batch::BatchPolicy;
use crate::domain::streaming::{StreamType, TopicPattern};

/// Payload transform. Returning `None` filters the event out.
pub type Transform = Arc<dyn Fn(&str, Value) -> Option<Value> + Send + Sync>;

#[derive(Debug, Clone)]
struct Batching {
    key_fields: Vec<&'static str>,
    policy: BatchPolicy,
}

/// Routing entry: which topics feed which stream, and how.
///
/// Registration order matters. The first processor with a matching pattern
/// receives the event.
#[derive(Clone)]
pub struct StreamProcessor {
    name: &'static str,
    stream: StreamType,
    message_type: String,
    patterns: Vec<TopicPattern>,
    transform: Option<Transform>,
    batching: Option<Batching>,
}

impl StreamProcessor {
    /// Processor forwarding to `stream`. The message type defaults to the
    /// stream name.
    #[must_use]
    pub fn new(name: &'static str, stream: StreamType) -> Self {
        Self {
            name,
            stream,
            message_type: stream.as_str().to_string(),
            patterns: Vec::new(),
            transform: None,
            batching: None,
        }
    }

    /// Add a topic pattern.
    #[must_use]
    pub fn pattern(mut self, pattern: &str) -> Self {
        self.patterns.push(TopicPattern::new(pattern));
        self
    }

    /// Set the envelope message type for immediate dispatch.
    #[must_use]
    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }

    /// Set a payload transform.
    #[must_use]
    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    /// Batch this stream, keying updates by the values of `key_fields`.
    #[must_use]
    pub fn batched(mut self, key_fields: &[&'static str], policy: BatchPolicy) -> Self {
        self.batching = Some(Batching {
            key_fields: key_fields.to_vec(),
            policy,
        });
        self
    }

    /// Processor name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Target stream.
    #[must_use]
    pub const fn stream(&self) -> StreamType {
        self.stream
    }

    /// Envelope message type.
    #[must_use]
    pub fn message_type_str(&self) -> &str {
        &self.message_type
    }

    /// Topic patterns in registration order.
    #[must_use]
    pub fn patterns(&self) -> &[TopicPattern] {
        &self.patterns
    }

    /// Batch policy, if this stream is batched.
    #[must_use]
    pub fn batch_policy(&self) -> Option<BatchPolicy> {
        self.batching.as_ref().map(|b| b.policy)
    }

    /// Whether any pattern matches `topic`.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(topic))
    }

    /// Run the transform, if any.
    #[must_use]
    pub fn apply(&self, topic: &str, payload: Value) -> Option<Value> {
        match &self.transform {
            Some(transform) => transform(topic, payload),
            None => Some(payload),
        }
    }

    /// Aggregation key for `data`.
    ///
    /// Every present key field contributes `name=value`, with the value in
    /// its JSON form so `"14"` and `14` stay apart. A payload carrying none
    /// of them gets a unique key so it is never merged with another update.
    #[must_use]
    pub fn batch_key(&self, data: &Value) -> String {
        let parts: Vec<String> = self
            .batching
            .iter()
            .flat_map(|b| b.key_fields.iter())
            .filter_map(|field| {
                let value = match data.get(*field)? {
                    Value::Null => return None,
                    Value::String(s) => Value::String(s.to_uppercase()),
                    other => other.clone(),
                };
                Some(format!("{field}={value}"))
            })
            .collect();

        if parts.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            parts.join("|")
        }
    }
}

impl fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("name", &self.name)
            .field("stream", &self.stream)
            .field("message_type", &self.message_type)
            .field("patterns", &self.patterns)
            .field("transform", &self.transform.is_some())
            .field("batching", &self.batching)
            .finish()
    }
}

fn wrap_status(_topic: &str, payload: Value) -> Option<Value> {
    match payload {
        Value::Null => None,
        Value::Object(_) => Some(payload),
        other => Some(json!({ "message": other })),
    }
}

/// Processor table for the platform's topics.
///
/// Market data and indicators are batched with `batch_policy`; everything
/// else is dispatched immediately.
#[must_use]
pub fn default_processors(batch_policy: BatchPolicy) -> Vec<StreamProcessor> {
    vec![
        StreamProcessor::new("market_data", StreamType::MarketData)
            .pattern("market.**")
            .pattern("market_data.**")
            .message_type("price_update")
            .batched(&["symbol", "timeframe"], batch_policy),
        StreamProcessor::new("indicators", StreamType::Indicators)
            .pattern("indicator.**")
            .pattern("indicators.**")
            .message_type("indicator_update")
            .batched(&["symbol", "indicator_type", "timeframe", "period"], batch_policy),
        StreamProcessor::new("signals", StreamType::Signals)
            .pattern("signal.**")
            .pattern("signals.**")
            .message_type("signal"),
        StreamProcessor::new("orders", StreamType::Orders)
            .pattern("order.**")
            .pattern("orders.**")
            .message_type("order_update"),
        StreamProcessor::new("portfolio", StreamType::Portfolio)
            .pattern("portfolio.**")
            .message_type("portfolio_update"),
        StreamProcessor::new("system_status", StreamType::SystemStatus)
            .pattern("system.**")
            .message_type("system_status")
            .transform(wrap_status),
        StreamProcessor::new("execution_progress", StreamType::ExecutionProgress)
            .pattern("broadcast.execution_progress"),
        StreamProcessor::new("execution_result", StreamType::ExecutionResult)
            .pattern("broadcast.execution_result"),
    ]
}
