//! Event Bridge
//!
//! Consumes bus events and routes each one to the first stream processor
//! whose topic patterns match.
//!
//! # Flow
//!
//! ```text
//! bus ──► handler(pattern) ──► first-match processor ──► transform
//!                                   │
//!              ┌────────────────────┴─────────────────────┐
//!              ▼                                          ▼
//!     BatchAggregator.add_update               semaphore-bounded task
//!              │                                          │
//!     batch loop (ready / tick)                           │
//!     split by size, retry                                │
//!              └───────────────► Broadcaster ◄────────────┘
//! ```
//!
//! Every distinct pattern gets one bus handler. A handler only processes
//! an event when its pattern is the first one in routing order to match,
//! so an event matched by several patterns is still handled once.

mod processor;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use processor::{StreamProcessor, Transform, default_processors};

use super::broadcaster::Broadcaster;
use super::broadcaster::BroadcastError;
use super::retry::{RetryConfig, retry_with_backoff_when};
use crate::application::ports::{EventBusPort, HandlerId, handler_fn};
use crate::domain::batch::{AggregatorStats, BatchAggregator, BatchPolicyError, BatchUpdate, FlushOutcome};
use crate::domain::health::ComponentHealth;
use crate::domain::streaming::{Event, StreamType, TopicPattern};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration & Errors
// =============================================================================

/// Event bridge configuration.
#[derive(Debug, Clone)]
pub struct EventBridgeConfig {
    /// Concurrent immediate (non-batched) dispatch tasks.
    pub immediate_dispatch_concurrency: usize,
    /// Serialized size ceiling of one batch envelope's items.
    pub max_message_size_bytes: usize,
    /// Retry policy for batch sends.
    pub batch_retry: RetryConfig,
    /// Publish-to-processing lag above which a warning is logged.
    pub processing_latency_threshold: Duration,
    /// Publish-to-broadcast latency above which a warning is logged.
    pub pipeline_latency_threshold: Duration,
    /// Time `stop()` waits for queues to drain and tasks to finish.
    pub shutdown_timeout: Duration,
}

impl Default for EventBridgeConfig {
    fn default() -> Self {
        Self {
            immediate_dispatch_concurrency: 10,
            max_message_size_bytes: 64 * 1024,
            batch_retry: RetryConfig::default(),
            processing_latency_threshold: Duration::from_millis(50),
            pipeline_latency_threshold: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Event bridge construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// A processor has no topic pattern.
    #[error("processor `{name}` has no topic patterns")]
    NoPatterns {
        /// Processor name.
        name: &'static str,
    },

    /// A processor's batch policy is invalid.
    #[error("processor `{name}`: {source}")]
    BatchPolicy {
        /// Processor name.
        name: &'static str,
        /// Policy problem.
        #[source]
        source: BatchPolicyError,
    },

    /// Immediate dispatch concurrency is zero.
    #[error("immediate_dispatch_concurrency must be at least 1")]
    ZeroConcurrency,

    /// Message size ceiling is zero.
    #[error("max_message_size_bytes must be at least 1")]
    ZeroMessageSize,
}

// =============================================================================
// Internal State
// =============================================================================

struct Route {
    processor: StreamProcessor,
    aggregator: Option<Arc<BatchAggregator>>,
}

#[derive(Debug, Default)]
struct Counters {
    events_received: AtomicU64,
    events_unmatched: AtomicU64,
    events_filtered: AtomicU64,
    events_batched: AtomicU64,
    dispatched: AtomicU64,
    dispatch_failed: AtomicU64,
    dispatch_cancelled: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    sub_batches: AtomicU64,
    latency_warnings: AtomicU64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn since(publish_time: DateTime<Utc>) -> Duration {
    (Utc::now() - publish_time).to_std().unwrap_or_default()
}

// =============================================================================
// Event Bridge
// =============================================================================

/// Routes bus events through processors into the broadcaster.
pub struct EventBridge {
    config: EventBridgeConfig,
    bus: Arc<dyn EventBusPort>,
    broadcaster: Arc<Broadcaster>,
    routes: Vec<Route>,
    /// Distinct patterns in routing order with their route index.
    patterns: Vec<(TopicPattern, usize)>,
    permits: Arc<Semaphore>,
    handlers: Mutex<Vec<(String, HandlerId)>>,
    running: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    dispatch_tasks: TaskTracker,
    batch_tasks: TaskTracker,
    counters: Counters,
}

impl EventBridge {
    /// Create a bridge. Processors are matched in the given order.
    ///
    /// # Errors
    ///
    /// Returns an error for a processor without patterns, an invalid
    /// batch policy or zero limits.
    pub fn new(
        config: EventBridgeConfig,
        processors: Vec<StreamProcessor>,
        bus: Arc<dyn EventBusPort>,
        broadcaster: Arc<Broadcaster>,
    ) -> Result<Self, BridgeError> {
        if config.immediate_dispatch_concurrency == 0 {
            return Err(BridgeError::ZeroConcurrency);
        }
        if config.max_message_size_bytes == 0 {
            return Err(BridgeError::ZeroMessageSize);
        }

        let mut routes = Vec::with_capacity(processors.len());
        let mut patterns: Vec<(TopicPattern, usize)> = Vec::new();

        for (index, processor) in processors.into_iter().enumerate() {
            let name = processor.name();
            if processor.patterns().is_empty() {
                return Err(BridgeError::NoPatterns { name });
            }

            for pattern in processor.patterns() {
                if !patterns.iter().any(|(p, _)| p == pattern) {
                    patterns.push((pattern.clone(), index));
                }
            }

            let aggregator = processor
                .batch_policy()
                .map(|policy| BatchAggregator::new(processor.stream(), policy).map(Arc::new))
                .transpose()
                .map_err(|source| BridgeError::BatchPolicy { name, source })?;

            routes.push(Route {
                processor,
                aggregator,
            });
        }

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.immediate_dispatch_concurrency)),
            config,
            bus,
            broadcaster,
            routes,
            patterns,
            handlers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            dispatch_tasks: TaskTracker::new(),
            batch_tasks: TaskTracker::new(),
            counters: Counters::default(),
        })
    }

    /// Subscribe to the bus and spawn one batch loop per batched stream.
    ///
    /// Returns `false` if already started or stopped.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.stopped.load(Ordering::Acquire) || self.running.swap(true, Ordering::AcqRel) {
            return false;
        }

        for route in &self.routes {
            if let Some(aggregator) = &route.aggregator {
                let this = Arc::clone(self);
                let aggregator = Arc::clone(aggregator);
                let name = route.processor.name();
                self.batch_tasks
                    .spawn(async move { this.run_batch_loop(name, aggregator).await });
            }
        }

        let mut handlers = self.handlers.lock();
        for (position, (pattern, _)) in self.patterns.iter().enumerate() {
            let bridge: Weak<Self> = Arc::downgrade(self);
            let handler = handler_fn(move |event: Event| {
                let bridge = bridge.clone();
                async move {
                    if let Some(bridge) = bridge.upgrade()
                        && bridge.owns(position, &event.topic)
                    {
                        bridge.process_event(event).await;
                    }
                }
            });
            let id = self.bus.subscribe(pattern.as_str(), handler);
            handlers.push((pattern.as_str().to_string(), id));
        }

        tracing::info!(
            processors = self.routes.len(),
            patterns = self.patterns.len(),
            "Event bridge started"
        );
        true
    }

    /// Whether the bridge accepts events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    fn owns(&self, position: usize, topic: &str) -> bool {
        self.patterns.iter().position(|(p, _)| p.matches(topic)) == Some(position)
    }

    fn route_index(&self, topic: &str) -> Option<usize> {
        self.patterns
            .iter()
            .find(|(p, _)| p.matches(topic))
            .map(|(_, index)| *index)
    }

    /// Name of the processor that would receive `topic`.
    #[must_use]
    pub fn route(&self, topic: &str) -> Option<&'static str> {
        self.route_index(topic)
            .map(|index| self.routes[index].processor.name())
    }

    // -------------------------------------------------------------------------
    // Event processing
    // -------------------------------------------------------------------------

    /// Route one event: merge it into its stream's batch or dispatch it
    /// immediately. Execution streams are forwarded before this returns;
    /// other streams get a spawned task and wait for a dispatch permit
    /// when all are taken.
    pub async fn process_event(self: &Arc<Self>, event: Event) {
        if !self.is_running() {
            return;
        }
        inc(&self.counters.events_received);

        let lag = since(event.publish_time);
        if lag > self.config.processing_latency_threshold {
            inc(&self.counters.latency_warnings);
            tracing::warn!(
                topic = %event.topic,
                lag_ms = lag.as_secs_f64() * 1000.0,
                "Event processing started late"
            );
        }

        let Some(index) = self.route_index(&event.topic) else {
            inc(&self.counters.events_unmatched);
            metrics::record_event_unmatched();
            tracing::debug!(topic = %event.topic, "No stream processor for topic");
            return;
        };

        let route = &self.routes[index];
        let processor = &route.processor;
        metrics::record_event_received(processor.name());

        let Some(data) = processor.apply(&event.topic, event.payload) else {
            inc(&self.counters.events_filtered);
            metrics::record_event_filtered(processor.name());
            tracing::trace!(topic = %event.topic, processor = processor.name(), "Event filtered");
            return;
        };

        if let Some(aggregator) = &route.aggregator {
            let outcome = aggregator.add_update(processor.batch_key(&data), data);
            inc(&self.counters.events_batched);
            record_flush(processor.stream(), outcome);
            return;
        }

        let publish_time = event.publish_time;

        // Session snapshots arrive in order from the tracker; forwarding
        // them on the publishing task keeps that order up to the queue.
        if processor.stream().is_execution() {
            self.dispatch(index, data, publish_time).await;
            return;
        }

        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };

        let this = Arc::clone(self);
        self.dispatch_tasks.spawn(async move {
            let _permit = permit;
            this.dispatch(index, data, publish_time).await;
        });
    }

    async fn dispatch(&self, index: usize, data: Value, publish_time: DateTime<Utc>) {
        let processor = &self.routes[index].processor;
        tokio::select! {
            () = self.cancel.cancelled() => {
                inc(&self.counters.dispatch_cancelled);
            }
            delivered = self.forward(processor, data) => {
                if delivered {
                    inc(&self.counters.dispatched);
                } else {
                    inc(&self.counters.dispatch_failed);
                }
                self.observe_pipeline_latency(processor.stream(), publish_time);
            }
        }
    }

    async fn forward(&self, processor: &StreamProcessor, data: Value) -> bool {
        let stream = processor.stream();
        let session_id = stream
            .is_execution()
            .then(|| data.get("session_id").and_then(Value::as_str).map(str::to_string))
            .flatten();

        match (stream, session_id) {
            (StreamType::ExecutionProgress, Some(id)) => {
                self.broadcaster.broadcast_execution_progress(&id, data).await
            }
            (StreamType::ExecutionResult, Some(id)) => {
                self.broadcaster.broadcast_execution_result(&id, data).await
            }
            _ => {
                self.broadcaster
                    .broadcast_message(stream, processor.message_type_str(), data, None)
                    .await
            }
        }
    }

    fn observe_pipeline_latency(&self, stream: StreamType, publish_time: DateTime<Utc>) {
        let latency = since(publish_time);
        metrics::record_pipeline_latency(stream, latency);
        if latency > self.config.pipeline_latency_threshold {
            inc(&self.counters.latency_warnings);
            tracing::warn!(
                stream = %stream,
                latency_ms = latency.as_secs_f64() * 1000.0,
                "Pipeline latency above threshold"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Batch loop
    // -------------------------------------------------------------------------

    async fn run_batch_loop(self: Arc<Self>, name: &'static str, aggregator: Arc<BatchAggregator>) {
        let tick = (aggregator.policy().flush_interval / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = aggregator.ready() => {}
                _ = ticker.tick() => {
                    record_flush(aggregator.stream(), aggregator.flush_if_due());
                }
            }

            while let Some(batch) = aggregator.pop_ready() {
                self.send_batch(name, batch).await;
            }
        }

        tracing::debug!(processor = name, "Batch loop exited");
    }

    async fn send_batch(&self, name: &'static str, batch: BatchUpdate) {
        let stream = batch.stream;
        let batch_id = batch.batch_id.to_string();
        let chunks = split_by_size(batch.into_items(), self.config.max_message_size_bytes);
        let split = chunks.len() > 1;

        for (n, chunk) in chunks.into_iter().enumerate() {
            let id = if split {
                format!("{batch_id}-{}", n + 1)
            } else {
                batch_id.clone()
            };
            let items = chunk.len();

            // Validation runs once; only backpressure is worth another try.
            let result = match self.broadcaster.prepare_batch(stream, &id, chunk) {
                Ok(envelope) => {
                    let broadcaster = &self.broadcaster;
                    retry_with_backoff_when(
                        self.config.batch_retry,
                        "batch_send",
                        move |_| broadcaster.broadcast_envelope(envelope.clone()),
                        BroadcastError::is_retryable,
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    inc(&self.counters.batches_sent);
                    if split {
                        inc(&self.counters.sub_batches);
                    }
                    metrics::record_batch_sent(stream, items);
                }
                Err(e) => {
                    inc(&self.counters.batches_failed);
                    tracing::error!(
                        processor = name,
                        stream = %stream,
                        batch_id = %id,
                        items,
                        error = %e,
                        "Batch not delivered"
                    );
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Stop the bridge: force-flush open batches, drain the batch queues,
    /// wait for immediate dispatches, cancel stragglers and unsubscribe
    /// every handler. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Stopping event bridge");
        let deadline = Instant::now() + self.config.shutdown_timeout;

        for route in &self.routes {
            if let Some(aggregator) = &route.aggregator
                && aggregator.stats().open_size > 0
            {
                record_flush(aggregator.stream(), aggregator.force_flush());
            }
        }

        let started = self.running.load(Ordering::Acquire);
        while started && self.pending_batches() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if self.pending_batches() > 0 {
            tracing::warn!(
                pending = self.pending_batches(),
                "Batch queues not drained before shutdown timeout"
            );
        }

        self.dispatch_tasks.close();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, self.dispatch_tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = self.dispatch_tasks.len(),
                "Cancelling immediate dispatches still running"
            );
        }

        self.cancel.cancel();
        self.batch_tasks.close();
        let grace = Duration::from_millis(500);
        let drained = async {
            self.dispatch_tasks.wait().await;
            self.batch_tasks.wait().await;
        };
        if tokio::time::timeout(grace, drained).await.is_err() {
            tracing::warn!("Event bridge tasks did not finish after cancellation");
        }

        let handlers = std::mem::take(&mut *self.handlers.lock());
        for (pattern, id) in handlers {
            if !self.bus.unsubscribe(&pattern, id) {
                tracing::debug!(pattern, handler = %id, "Handler already unsubscribed");
            }
        }

        self.running.store(false, Ordering::Release);
        tracing::info!("Event bridge stopped");
    }

    fn pending_batches(&self) -> usize {
        self.routes
            .iter()
            .filter_map(|r| r.aggregator.as_ref())
            .map(|a| a.pending_len())
            .sum()
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Bridge statistics.
    #[must_use]
    pub fn get_stats(&self) -> BridgeStats {
        let c = &self.counters;
        BridgeStats {
            running: self.is_running(),
            events_received: load(&c.events_received),
            events_unmatched: load(&c.events_unmatched),
            events_filtered: load(&c.events_filtered),
            events_batched: load(&c.events_batched),
            dispatched: load(&c.dispatched),
            dispatch_failed: load(&c.dispatch_failed),
            dispatch_cancelled: load(&c.dispatch_cancelled),
            in_flight_dispatches: self.dispatch_tasks.len(),
            batches_sent: load(&c.batches_sent),
            batches_failed: load(&c.batches_failed),
            sub_batches: load(&c.sub_batches),
            latency_warnings: load(&c.latency_warnings),
            handlers: self.handlers.lock().len(),
            processors: self
                .routes
                .iter()
                .map(|route| ProcessorStats {
                    name: route.processor.name(),
                    stream: route.processor.stream(),
                    aggregator: route.aggregator.as_ref().map(|a| a.stats()),
                })
                .collect(),
        }
    }

    /// Bridge health.
    #[must_use]
    pub fn health_check(&self) -> ComponentHealth {
        let stats = self.get_stats();
        let mut health = ComponentHealth::healthy("event_bridge");

        if !stats.running {
            health.fail("event bridge is not running");
        }

        let dropped: u64 = stats
            .processors
            .iter()
            .filter_map(|p| p.aggregator.as_ref())
            .map(|a| a.batches_dropped)
            .sum();
        if dropped > 0 {
            health.degrade(format!("{dropped} batches dropped from full queues"));
        }
        if stats.dispatch_failed > 0 || stats.batches_failed > 0 {
            health.degrade(format!(
                "{} dispatches and {} batches failed",
                stats.dispatch_failed, stats.batches_failed
            ));
        }
        health
    }
}

fn record_flush(stream: StreamType, outcome: FlushOutcome) {
    if outcome.flushed {
        metrics::record_batch_flushed(stream);
    }
    if outcome.dropped_oldest {
        metrics::record_batch_dropped(stream);
    }
}

/// Split items into ordered chunks whose serialized size stays under
/// `max_bytes`. An item larger than the ceiling travels alone.
fn split_by_size(items: Vec<Value>, max_bytes: usize) -> Vec<Vec<Value>> {
    // Array brackets, then one separator per item.
    const ARRAY_OVERHEAD: usize = 2;

    let mut chunks = Vec::new();
    let mut current: Vec<Value> = Vec::new();
    let mut current_bytes = ARRAY_OVERHEAD;

    for item in items {
        let size = serde_json::to_vec(&item).map_or(0, |bytes| bytes.len()) + 1;

        if size + ARRAY_OVERHEAD > max_bytes {
            tracing::warn!(size, max_bytes, "Batch item exceeds message size ceiling, sending alone");
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_bytes = ARRAY_OVERHEAD;
            }
            chunks.push(vec![item]);
            continue;
        }

        if !current.is_empty() && current_bytes + size > max_bytes {
            chunks.push(std::mem::take(&mut current));
            current_bytes = ARRAY_OVERHEAD;
        }
        current_bytes += size;
        current.push(item);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Per-processor statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStats {
    /// Processor name.
    pub name: &'static str,
    /// Target stream.
    pub stream: StreamType,
    /// Aggregator state for batched streams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregator: Option<AggregatorStats>,
}

/// Event bridge statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    /// Accepting events.
    pub running: bool,
    /// Events received.
    pub events_received: u64,
    /// Events no processor matched.
    pub events_unmatched: u64,
    /// Events removed by a transform.
    pub events_filtered: u64,
    /// Events merged into a batch.
    pub events_batched: u64,
    /// Immediate dispatches accepted by the broadcaster.
    pub dispatched: u64,
    /// Immediate dispatches the broadcaster rejected or dropped.
    pub dispatch_failed: u64,
    /// Immediate dispatches cancelled at shutdown.
    pub dispatch_cancelled: u64,
    /// Immediate dispatches in flight.
    pub in_flight_dispatches: usize,
    /// Batch envelopes accepted by the broadcaster.
    pub batches_sent: u64,
    /// Batch envelopes lost after retries.
    pub batches_failed: u64,
    /// Batch envelopes produced by size splitting.
    pub sub_batches: u64,
    /// Processing or pipeline latency warnings.
    pub latency_warnings: u64,
    /// Registered bus handlers.
    pub handlers: usize,
    /// Per-processor details.
    pub processors: Vec<ProcessorStats>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::application::ports::{TransportError, TransportPort};
    use crate::application::services::broadcaster::BroadcasterConfig;
    use crate::domain::batch::BatchPolicy;
    use crate::domain::streaming::Envelope;
    use crate::domain::subscription::ClientId;
    use crate::infrastructure::bus::InMemoryEventBus;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Arc<Envelope>>>,
    }

    impl RecordingTransport {
        fn envelopes(&self) -> Vec<Arc<Envelope>> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl TransportPort for RecordingTransport {
        async fn broadcast_to_subscribers(
            &self,
            _stream: StreamType,
            envelope: Arc<Envelope>,
            _exclude_client: Option<ClientId>,
        ) -> Result<usize, TransportError> {
            self.sent.lock().push(envelope);
            Ok(1)
        }
    }

    struct Harness {
        bus: Arc<InMemoryEventBus>,
        transport: Arc<RecordingTransport>,
        broadcaster: Arc<Broadcaster>,
        bridge: Arc<EventBridge>,
    }

    fn harness(processors: Vec<StreamProcessor>, config: EventBridgeConfig) -> Harness {
        let bus = Arc::new(InMemoryEventBus::new());
        let transport = Arc::new(RecordingTransport::default());
        let broadcaster = Arc::new(
            Broadcaster::new(BroadcasterConfig::default(), Arc::clone(&transport) as _).unwrap(),
        );
        assert!(broadcaster.start());
        let bridge = Arc::new(
            EventBridge::new(config, processors, Arc::clone(&bus) as _, Arc::clone(&broadcaster))
                .unwrap(),
        );
        assert!(bridge.start());
        Harness {
            bus,
            transport,
            broadcaster,
            bridge,
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn fast_batches() -> BatchPolicy {
        BatchPolicy {
            max_batch_size: 10,
            flush_interval: Duration::from_millis(20),
            max_pending_batches: 10,
        }
    }

    #[test]
    fn construction_validates_processors() {
        let bus: Arc<dyn EventBusPort> = Arc::new(InMemoryEventBus::new());
        let broadcaster = Arc::new(
            Broadcaster::new(
                BroadcasterConfig::default(),
                Arc::new(crate::application::ports::NoOpTransport),
            )
            .unwrap(),
        );

        let no_patterns = EventBridge::new(
            EventBridgeConfig::default(),
            vec![StreamProcessor::new("empty", StreamType::Signals)],
            Arc::clone(&bus),
            Arc::clone(&broadcaster),
        );
        assert_eq!(no_patterns.err(), Some(BridgeError::NoPatterns { name: "empty" }));

        let bad_policy = EventBridge::new(
            EventBridgeConfig::default(),
            vec![
                StreamProcessor::new("md", StreamType::MarketData)
                    .pattern("market.*")
                    .batched(
                        &["symbol"],
                        BatchPolicy {
                            max_batch_size: 0,
                            ..BatchPolicy::default()
                        },
                    ),
            ],
            Arc::clone(&bus),
            Arc::clone(&broadcaster),
        );
        assert!(matches!(bad_policy.err(), Some(BridgeError::BatchPolicy { name: "md", .. })));

        let zero = EventBridge::new(
            EventBridgeConfig {
                immediate_dispatch_concurrency: 0,
                ..EventBridgeConfig::default()
            },
            Vec::new(),
            bus,
            broadcaster,
        );
        assert_eq!(zero.err(), Some(BridgeError::ZeroConcurrency));
    }

    #[tokio::test]
    async fn first_registered_processor_wins() {
        let processors = vec![
            StreamProcessor::new("first", StreamType::Indicators)
                .pattern("indicator.*")
                .message_type("first"),
            StreamProcessor::new("second", StreamType::Signals)
                .pattern("indicator.updated")
                .message_type("second"),
        ];
        let h = harness(processors, EventBridgeConfig::default());
        assert_eq!(h.bridge.route("indicator.updated"), Some("first"));

        for _ in 0..5 {
            h.bus
                .publish(
                    "indicator.updated",
                    json!({"symbol": "BTC", "indicator_type": "rsi", "signal_type": "x"}),
                )
                .await;
        }

        wait_for(|| h.broadcaster.get_stats().sent == 5).await;
        let envelopes = h.transport.envelopes();
        assert!(envelopes.iter().all(|e| e.message_type == "first"));
        assert_eq!(h.bridge.get_stats().events_received, 5);
        h.bridge.stop().await;
    }

    #[tokio::test]
    async fn transform_filter_is_counted() {
        let processors = vec![
            StreamProcessor::new("sys", StreamType::SystemStatus)
                .pattern("system.*")
                .transform(|_, payload| payload.get("visible").map(|_| payload.clone())),
        ];
        let h = harness(processors, EventBridgeConfig::default());

        h.bus.publish("system.notice", json!({"internal": true})).await;
        h.bus.publish("system.notice", json!({"visible": true})).await;

        wait_for(|| h.broadcaster.get_stats().sent == 1).await;
        let stats = h.bridge.get_stats();
        assert_eq!(stats.events_filtered, 1);
        assert_eq!(stats.dispatched, 1);
        h.bridge.stop().await;
    }

    #[tokio::test]
    async fn batched_stream_merges_by_key() {
        let processors = vec![
            StreamProcessor::new("md", StreamType::MarketData)
                .pattern("market.**")
                .batched(&["symbol"], fast_batches()),
        ];
        let h = harness(processors, EventBridgeConfig::default());

        for price in [1, 2, 3] {
            h.bus
                .publish("market.price", json!({"symbol": "BTC", "price": price}))
                .await;
        }
        h.bus
            .publish("market.price", json!({"symbol": "ETH", "price": 9}))
            .await;

        wait_for(|| h.bridge.get_stats().batches_sent == 1).await;
        wait_for(|| !h.transport.envelopes().is_empty()).await;
        let envelope = Arc::clone(&h.transport.envelopes()[0]);
        assert!(envelope.is_batch());
        assert_eq!(envelope.batch_size, Some(2));
        assert_eq!(envelope.data[0]["price"], 3);
        h.bridge.stop().await;
    }

    #[tokio::test]
    async fn stop_flushes_open_batches_and_unsubscribes() {
        let processors = vec![
            StreamProcessor::new("md", StreamType::MarketData)
                .pattern("market.**")
                .batched(
                    &["symbol"],
                    BatchPolicy {
                        flush_interval: Duration::from_secs(60),
                        ..fast_batches()
                    },
                ),
        ];
        let h = harness(processors, EventBridgeConfig::default());

        h.bus.publish("market.tick", json!({"symbol": "BTC"})).await;
        assert_eq!(h.bridge.get_stats().batches_sent, 0);

        h.bridge.stop().await;
        h.bridge.stop().await;

        let stats = h.bridge.get_stats();
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.handlers, 0);
        assert_eq!(h.bus.handler_count(), 0);
        assert_eq!(h.bus.publish("market.tick", json!({"symbol": "BTC"})).await, 0);
        assert!(!h.bridge.is_running());
    }

    #[tokio::test]
    async fn execution_streams_use_session_paths() {
        let processors = vec![
            StreamProcessor::new("progress", StreamType::ExecutionProgress)
                .pattern("broadcast.execution_progress"),
        ];
        let h = harness(processors, EventBridgeConfig::default());

        h.bus
            .publish(
                "broadcast.execution_progress",
                json!({"session_id": "s1", "progress_percentage": 5.0}),
            )
            .await;
        h.bus
            .publish(
                "broadcast.execution_progress",
                json!({"session_id": "s1", "progress_percentage": 5.1}),
            )
            .await;

        wait_for(|| h.bridge.get_stats().dispatched == 2).await;
        let broadcaster = h.broadcaster.get_stats();
        assert_eq!(broadcaster.progress_throttled, 1);
        assert_eq!(broadcaster.enqueued, 1);
        h.bridge.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn session_snapshots_are_enqueued_in_publish_order() {
        let processors = vec![
            StreamProcessor::new("progress", StreamType::ExecutionProgress)
                .pattern("broadcast.execution_progress"),
        ];
        let h = harness(processors, EventBridgeConfig::default());

        for step in 1..=20_u64 {
            h.bus
                .publish(
                    "broadcast.execution_progress",
                    json!({"session_id": "s1", "current_step": step, "progress_percentage": step * 5}),
                )
                .await;
            assert_eq!(h.broadcaster.get_stats().enqueued, step);
        }

        wait_for(|| h.broadcaster.get_stats().sent == 20).await;
        let steps: Vec<u64> = h
            .transport
            .envelopes()
            .iter()
            .filter_map(|e| e.data["current_step"].as_u64())
            .collect();
        assert_eq!(steps, (1..=20).collect::<Vec<_>>());
        h.bridge.stop().await;
    }

    #[tokio::test]
    async fn invalid_batch_is_not_retried() {
        let processors = vec![
            StreamProcessor::new("ind", StreamType::Indicators)
                .pattern("indicator.*")
                .batched(&["symbol"], fast_batches()),
        ];
        let h = harness(processors, EventBridgeConfig::default());

        h.bus
            .publish("indicator.updated", json!({"symbol": "BTC", "value": 1}))
            .await;

        wait_for(|| h.bridge.get_stats().batches_failed == 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.broadcaster.get_stats().validation_failures, 1);
        assert!(h.transport.envelopes().is_empty());
        h.bridge.stop().await;
    }

    #[tokio::test]
    async fn unmatched_topics_are_counted() {
        let h = harness(
            vec![StreamProcessor::new("sig", StreamType::Signals).pattern("signal.*")],
            EventBridgeConfig::default(),
        );

        h.bridge
            .process_event(Event::now("unknown.topic", json!({})))
            .await;
        assert_eq!(h.bridge.get_stats().events_unmatched, 1);
        h.bridge.stop().await;
    }

    #[test]
    fn split_respects_ceiling_and_order() {
        let items: Vec<Value> = (0..6).map(|i| json!({"i": i})).collect();
        // Each item serializes to 7 bytes plus a separator.
        let chunks = split_by_size(items, 2 + 8 * 2);

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 2));
        assert_eq!(chunks[2][1], json!({"i": 5}));
    }

    #[test]
    fn oversized_item_travels_alone() {
        let big = json!({"blob": "x".repeat(100)});
        let chunks = split_by_size(vec![json!({"i": 0}), big.clone(), json!({"i": 1})], 32);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1], vec![big]);
    }
}
