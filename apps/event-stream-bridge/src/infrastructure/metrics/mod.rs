//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Events**: Bus events received, unmatched and filtered by the bridge
//! - **Messages**: Broadcast enqueue, delivery and drops by reason
//! - **Batches**: Flushes, drops and sends per stream
//! - **Sessions**: Execution sessions started, finished and evicted
//! - **Latency**: Queue, broadcast and end-to-end pipeline latency
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::StreamType;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder. Later calls return the
/// existing handle.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Bridge
    describe_counter!(
        "stream_bridge_events_received_total",
        "Bus events received by the bridge"
    );
    describe_counter!(
        "stream_bridge_events_unmatched_total",
        "Bus events that matched no stream processor"
    );
    describe_counter!(
        "stream_bridge_events_filtered_total",
        "Bus events dropped by a processor transform"
    );

    // Broadcaster
    describe_counter!(
        "stream_bridge_messages_enqueued_total",
        "Messages accepted onto the broadcast queue"
    );
    describe_counter!(
        "stream_bridge_messages_sent_total",
        "Messages handed to the transport"
    );
    describe_counter!(
        "stream_bridge_messages_dropped_total",
        "Messages dropped by reason"
    );
    describe_counter!(
        "stream_bridge_validation_failures_total",
        "Messages rejected for missing required fields"
    );
    describe_counter!(
        "stream_bridge_transport_retries_total",
        "Transport delivery retries"
    );
    describe_counter!(
        "stream_bridge_transport_failures_total",
        "Transport deliveries that failed after every retry"
    );
    describe_counter!(
        "stream_bridge_progress_throttled_total",
        "Execution progress updates collapsed by the throttle"
    );
    describe_gauge!(
        "stream_bridge_broadcast_queue_depth",
        "Messages waiting in the broadcast queue"
    );

    // Batches
    describe_counter!(
        "stream_bridge_batches_flushed_total",
        "Batches flushed by the aggregators"
    );
    describe_counter!(
        "stream_bridge_batches_dropped_total",
        "Flushed batches dropped because the batch queue was full"
    );
    describe_counter!(
        "stream_bridge_batches_sent_total",
        "Batches delivered to the broadcaster"
    );

    // Sessions
    describe_counter!(
        "stream_bridge_sessions_started_total",
        "Execution sessions started"
    );
    describe_counter!(
        "stream_bridge_sessions_finished_total",
        "Execution sessions finished by terminal status"
    );
    describe_counter!(
        "stream_bridge_sessions_evicted_total",
        "Execution sessions evicted by the TTL sweep"
    );
    describe_gauge!(
        "stream_bridge_active_sessions",
        "Execution sessions currently tracked"
    );

    // Clients
    describe_gauge!("stream_bridge_connected_clients", "Connected clients");
    describe_gauge!(
        "stream_bridge_subscriptions_total",
        "Client subscriptions by stream"
    );

    // Latency histograms
    describe_histogram!(
        "stream_bridge_queue_latency_seconds",
        "Time messages spend in the broadcast queue"
    );
    describe_histogram!(
        "stream_bridge_broadcast_latency_seconds",
        "Time spent in the transport per message"
    );
    describe_histogram!(
        "stream_bridge_pipeline_latency_seconds",
        "Time from bus publish to broadcast completion"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Reasons a message can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Broadcast queue full for the whole enqueue timeout.
    QueueFull,
    /// Broadcaster stopped.
    Closed,
    /// Rate limiter wait timed out.
    RateLimited,
    /// Session already reported its terminal status.
    AfterTerminal,
    /// Client outbound buffer stayed full for the send timeout.
    SlowConsumer,
}

impl DropReason {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
            Self::RateLimited => "rate_limited",
            Self::AfterTerminal => "after_terminal",
            Self::SlowConsumer => "slow_consumer",
        }
    }
}

/// Record a bus event received by the bridge.
pub fn record_event_received(processor: &'static str) {
    counter!("stream_bridge_events_received_total", "processor" => processor).increment(1);
}

/// Record a bus event no processor matched.
pub fn record_event_unmatched() {
    counter!("stream_bridge_events_unmatched_total").increment(1);
}

/// Record a bus event dropped by a transform.
pub fn record_event_filtered(processor: &'static str) {
    counter!("stream_bridge_events_filtered_total", "processor" => processor).increment(1);
}

/// Record a message accepted onto the broadcast queue.
pub fn record_message_enqueued(stream: StreamType) {
    counter!("stream_bridge_messages_enqueued_total", "stream" => stream.as_str()).increment(1);
}

/// Record a message handed to the transport.
pub fn record_message_sent(stream: StreamType, delivered_clients: usize) {
    counter!("stream_bridge_messages_sent_total", "stream" => stream.as_str()).increment(1);
    histogram!("stream_bridge_delivered_clients", "stream" => stream.as_str())
        .record(usize_to_f64(delivered_clients));
}

/// Record a dropped message.
pub fn record_message_dropped(stream: StreamType, reason: DropReason) {
    counter!(
        "stream_bridge_messages_dropped_total",
        "stream" => stream.as_str(),
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a validation failure.
pub fn record_validation_failure(stream: StreamType) {
    counter!("stream_bridge_validation_failures_total", "stream" => stream.as_str()).increment(1);
}

/// Record a transport retry.
pub fn record_transport_retry(stream: StreamType) {
    counter!("stream_bridge_transport_retries_total", "stream" => stream.as_str()).increment(1);
}

/// Record a terminal transport failure.
pub fn record_transport_failure(stream: StreamType) {
    counter!("stream_bridge_transport_failures_total", "stream" => stream.as_str()).increment(1);
}

/// Record a collapsed progress update.
pub fn record_progress_throttled() {
    counter!("stream_bridge_progress_throttled_total").increment(1);
}

/// Update the broadcast queue depth.
pub fn set_queue_depth(depth: usize) {
    gauge!("stream_bridge_broadcast_queue_depth").set(usize_to_f64(depth));
}

/// Record a batch flush.
pub fn record_batch_flushed(stream: StreamType) {
    counter!("stream_bridge_batches_flushed_total", "stream" => stream.as_str()).increment(1);
}

/// Record a batch dropped from a full batch queue.
pub fn record_batch_dropped(stream: StreamType) {
    counter!("stream_bridge_batches_dropped_total", "stream" => stream.as_str()).increment(1);
}

/// Record a batch delivered to the broadcaster.
pub fn record_batch_sent(stream: StreamType, items: usize) {
    counter!("stream_bridge_batches_sent_total", "stream" => stream.as_str()).increment(1);
    histogram!("stream_bridge_batch_items", "stream" => stream.as_str())
        .record(usize_to_f64(items));
}

/// Record a session start.
pub fn record_session_started() {
    counter!("stream_bridge_sessions_started_total").increment(1);
}

/// Record a session reaching a terminal status.
pub fn record_session_finished(status: &'static str) {
    counter!("stream_bridge_sessions_finished_total", "status" => status).increment(1);
}

/// Record sessions evicted by the TTL sweep.
pub fn record_sessions_evicted(count: usize) {
    counter!("stream_bridge_sessions_evicted_total").increment(count as u64);
}

/// Update the active session count.
pub fn set_active_sessions(count: usize) {
    gauge!("stream_bridge_active_sessions").set(usize_to_f64(count));
}

/// Update the connected client count.
pub fn set_connected_clients(count: usize) {
    gauge!("stream_bridge_connected_clients").set(usize_to_f64(count));
}

/// Update the subscription count for a stream.
pub fn set_subscriptions(stream: StreamType, count: usize) {
    gauge!("stream_bridge_subscriptions_total", "stream" => stream.as_str())
        .set(usize_to_f64(count));
}

/// Record time spent in the broadcast queue.
pub fn record_queue_latency(stream: StreamType, duration: Duration) {
    histogram!("stream_bridge_queue_latency_seconds", "stream" => stream.as_str())
        .record(duration.as_secs_f64());
}

/// Record time spent in the transport.
pub fn record_broadcast_latency(stream: StreamType, duration: Duration) {
    histogram!("stream_bridge_broadcast_latency_seconds", "stream" => stream.as_str())
        .record(duration.as_secs_f64());
}

/// Record publish-to-broadcast latency.
pub fn record_pipeline_latency(stream: StreamType, duration: Duration) {
    histogram!("stream_bridge_pipeline_latency_seconds", "stream" => stream.as_str())
        .record(duration.as_secs_f64());
}

#[allow(clippy::cast_precision_loss)]
const fn usize_to_f64(value: usize) -> f64 {
    value as f64
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::QueueFull.as_str(), "queue_full");
        assert_eq!(DropReason::Closed.as_str(), "closed");
        assert_eq!(DropReason::RateLimited.as_str(), "rate_limited");
        assert_eq!(DropReason::AfterTerminal.as_str(), "after_terminal");
        assert_eq!(DropReason::SlowConsumer.as_str(), "slow_consumer");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_message_enqueued(StreamType::Signals);
        record_message_dropped(StreamType::Orders, DropReason::QueueFull);
        record_queue_latency(StreamType::MarketData, Duration::from_millis(3));
        set_active_sessions(2);
    }
}
