//! Broadcaster
//!
//! Single choke point for every outbound message.
//!
//! # Pipeline
//!
//! ```text
//! broadcast_*() ──► validate ──► envelope ──► bounded queue ──► consumer
//!                                  (10ms enqueue timeout, drop on full)  │
//!                                                                        ▼
//!                                        rate limiter (bounded wait, drop on timeout)
//!                                                                        │
//!                                                                        ▼
//!                                        TransportPort::broadcast_to_subscribers
//!                                          (failures retried off the loop)
//! ```
//!
//! Delivery is best-effort. The only message retried on enqueue is a
//! session's terminal status.

mod latency;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use latency::{LatencySummary, LatencyWindow};

use super::retry::{BackoffPolicy, RetryConfig};
use crate::application::ports::TransportPort;
use crate::domain::health::ComponentHealth;
use crate::domain::rate_limit::{RateLimitError, TokenBucket, TokenBucketStats};
use crate::domain::session::{ProgressThrottle, SessionStatus, ThrottleDecision};
use crate::domain::streaming::{Envelope, StreamType};
use crate::domain::subscription::ClientId;
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Configuration
// =============================================================================

/// Broadcaster configuration.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Bound of the broadcast queue.
    pub max_queue_size: usize,
    /// How long an enqueue may wait for room before the message is dropped.
    pub enqueue_timeout: Duration,
    /// Latency above which a breach is logged.
    pub latency_threshold: Duration,
    /// Stricter threshold for trading-critical streams.
    pub critical_latency_threshold: Duration,
    /// Streams with the stricter threshold.
    pub critical_streams: HashSet<StreamType>,
    /// Token bucket capacity.
    pub rate_limit_max_tokens: f64,
    /// Token bucket refill per second.
    pub rate_limit_refill_rate: f64,
    /// Longest wait for a token before the message is dropped.
    pub rate_limit_max_wait: Duration,
    /// Streams that bypass the rate limiter.
    pub rate_limit_exempt: HashSet<StreamType>,
    /// Window in which near-duplicate progress updates are collapsed.
    pub progress_throttle_interval: Duration,
    /// Percentage movement that defeats the throttle.
    pub progress_min_delta: f64,
    /// Transport retry policy.
    pub transport_retry: RetryConfig,
    /// Enqueue retry policy for terminal session messages.
    pub result_retry: RetryConfig,
    /// Samples kept per latency window.
    pub latency_window: usize,
    /// Interval of the throttle pruning sweep.
    pub cleanup_interval: Duration,
    /// Age after which throttle bookkeeping is pruned.
    pub throttle_retention: Duration,
    /// Time `stop()` waits for the queue to drain and tasks to finish.
    pub shutdown_timeout: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            enqueue_timeout: Duration::from_millis(10),
            latency_threshold: Duration::from_millis(100),
            critical_latency_threshold: Duration::from_millis(50),
            critical_streams: [StreamType::Signals, StreamType::Orders].into(),
            rate_limit_max_tokens: 1_000.0,
            rate_limit_refill_rate: 500.0,
            rate_limit_max_wait: Duration::from_millis(100),
            rate_limit_exempt: [StreamType::MarketData, StreamType::Indicators].into(),
            progress_throttle_interval: Duration::from_millis(500),
            progress_min_delta: 1.0,
            transport_retry: RetryConfig::default(),
            result_retry: RetryConfig {
                max_attempts: 5,
                ..RetryConfig::default()
            },
            latency_window: 1_000,
            cleanup_interval: Duration::from_secs(60),
            throttle_retention: Duration::from_secs(60 * 60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Broadcaster errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BroadcastError {
    /// Payload failed required-field validation.
    #[error("invalid {stream} payload: {reason}")]
    Validation {
        /// Target stream.
        stream: StreamType,
        /// What is wrong.
        reason: String,
    },

    /// Rate limiter parameters are invalid.
    #[error(transparent)]
    RateLimiter(#[from] RateLimitError),

    /// Queue bound is zero.
    #[error("max_queue_size must be at least 1")]
    ZeroQueueSize,

    /// Every item of a batch failed validation.
    #[error("{stream} batch has no valid item ({rejected} rejected)")]
    EmptyBatch {
        /// Target stream.
        stream: StreamType,
        /// Items removed by validation.
        rejected: usize,
    },

    /// The queue stayed full for the whole enqueue timeout.
    #[error("{stream} message dropped, broadcast queue full")]
    QueueFull {
        /// Target stream.
        stream: StreamType,
    },

    /// The broadcaster is stopped.
    #[error("broadcaster stopped")]
    Closed,
}

impl BroadcastError {
    /// Whether sending the same message again may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}

/// Check that `data` is an object carrying the stream's required fields.
///
/// # Errors
///
/// Returns [`BroadcastError::Validation`] naming the first problem.
pub fn validate_payload(stream: StreamType, data: &Value) -> Result<(), BroadcastError> {
    let Value::Object(map) = data else {
        return Err(BroadcastError::Validation {
            stream,
            reason: "payload must be a JSON object".to_string(),
        });
    };

    if let Some(missing) = stream
        .required_fields()
        .iter()
        .find(|field| map.get(**field).is_none_or(Value::is_null))
    {
        return Err(BroadcastError::Validation {
            stream,
            reason: format!("missing required field `{missing}`"),
        });
    }
    Ok(())
}

fn with_session_id(session_id: &str, data: Value) -> Value {
    match data {
        Value::Object(mut map) => {
            map.entry("session_id")
                .or_insert_with(|| Value::String(session_id.to_string()));
            Value::Object(map)
        }
        other => other,
    }
}

// =============================================================================
// Queue Message & Counters
// =============================================================================

#[derive(Debug)]
struct QueuedMessage {
    stream: StreamType,
    envelope: Arc<Envelope>,
    exclude: Option<ClientId>,
    enqueued_at: Instant,
}

impl QueuedMessage {
    fn new(envelope: Envelope, exclude: Option<&str>) -> Self {
        Self {
            stream: envelope.stream,
            envelope: Arc::new(envelope),
            exclude: exclude.map(str::to_string),
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    sent: AtomicU64,
    delivered_clients: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_closed: AtomicU64,
    rate_limited: AtomicU64,
    validation_failures: AtomicU64,
    transport_errors: AtomicU64,
    transport_retries: AtomicU64,
    terminal_failures: AtomicU64,
    progress_throttled: AtomicU64,
    progress_after_terminal: AtomicU64,
    latency_breaches: AtomicU64,
    critical_latency_breaches: AtomicU64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

// =============================================================================
// Broadcaster
// =============================================================================

/// Rate-limited, backpressure-aware broadcaster.
pub struct Broadcaster {
    config: BroadcasterConfig,
    transport: Arc<dyn TransportPort>,
    limiter: TokenBucket,
    throttle: ProgressThrottle,
    tx: mpsc::Sender<QueuedMessage>,
    rx: Mutex<Option<mpsc::Receiver<QueuedMessage>>>,
    running: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
    counters: Counters,
    queue_latency: Mutex<LatencyWindow>,
    broadcast_latency: Mutex<LatencyWindow>,
}

impl Broadcaster {
    /// Create a broadcaster. Call [`Broadcaster::start`] to begin delivery.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero queue bound or invalid rate limiter
    /// parameters.
    pub fn new(
        config: BroadcasterConfig,
        transport: Arc<dyn TransportPort>,
    ) -> Result<Self, BroadcastError> {
        if config.max_queue_size == 0 {
            return Err(BroadcastError::ZeroQueueSize);
        }
        let limiter = TokenBucket::new(config.rate_limit_max_tokens, config.rate_limit_refill_rate)?;
        let throttle =
            ProgressThrottle::new(config.progress_throttle_interval, config.progress_min_delta);
        let (tx, rx) = mpsc::channel(config.max_queue_size);

        Ok(Self {
            limiter,
            throttle,
            tx,
            rx: Mutex::new(Some(rx)),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            counters: Counters::default(),
            queue_latency: Mutex::new(LatencyWindow::new(config.latency_window)),
            broadcast_latency: Mutex::new(LatencyWindow::new(config.latency_window)),
            transport,
            config,
        })
    }

    /// Spawn the queue consumer and the maintenance loop.
    ///
    /// Returns `false` if already started or stopped.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let Some(rx) = self.rx.lock().take() else {
            return false;
        };

        self.running.store(true, Ordering::Release);

        let this = Arc::clone(self);
        self.tasks.spawn(async move { this.run_consumer(rx).await });

        let this = Arc::clone(self);
        self.tasks.spawn(async move { this.run_maintenance().await });

        tracing::info!(
            queue_size = self.config.max_queue_size,
            rate_limit = self.config.rate_limit_refill_rate,
            "Broadcaster started"
        );
        true
    }

    /// Drain the queue (bounded by the shutdown timeout), cancel the
    /// consumer and wait for in-flight retries. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(queue_depth = self.queue_depth(), "Stopping broadcaster");

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while self.running.load(Ordering::Acquire)
            && self.queue_depth() > 0
            && Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.cancel.cancel();
        self.tasks.close();

        let grace = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(100));
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::warn!("Broadcaster tasks did not finish before shutdown timeout");
        }

        self.running.store(false, Ordering::Release);
        tracing::info!("Broadcaster stopped");
    }

    /// Whether the consumer is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    /// Messages waiting in the queue.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.config.max_queue_size.saturating_sub(self.tx.capacity())
    }

    // -------------------------------------------------------------------------
    // Public broadcast API
    // -------------------------------------------------------------------------

    /// Validate, envelope and enqueue one message.
    ///
    /// Returns `false` when the message was rejected or dropped.
    pub async fn broadcast_message(
        &self,
        stream: StreamType,
        message_type: &str,
        data: Value,
        exclude_client: Option<&str>,
    ) -> bool {
        if let Err(e) = validate_payload(stream, &data) {
            self.reject(&e);
            return false;
        }
        self.enqueue(Envelope::single(stream, message_type, data), exclude_client)
            .await
            .is_ok()
    }

    /// Validate a batch and enqueue it. Invalid items are removed and
    /// counted.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::EmptyBatch`] when no item is valid, or the
    /// enqueue failure.
    pub async fn broadcast_batch(
        &self,
        stream: StreamType,
        batch_id: &str,
        items: Vec<Value>,
    ) -> Result<(), BroadcastError> {
        let envelope = self.prepare_batch(stream, batch_id, items)?;
        self.broadcast_envelope(envelope).await
    }

    /// Validate a batch into its envelope. Each invalid item is removed and
    /// counted once, so the envelope can be enqueued repeatedly without
    /// validating again.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::EmptyBatch`] when no item is valid.
    pub fn prepare_batch(
        &self,
        stream: StreamType,
        batch_id: &str,
        items: Vec<Value>,
    ) -> Result<Envelope, BroadcastError> {
        let total = items.len();
        let valid: Vec<Value> = items
            .into_iter()
            .filter(|item| match validate_payload(stream, item) {
                Ok(()) => true,
                Err(e) => {
                    self.reject(&e);
                    false
                }
            })
            .collect();

        if valid.is_empty() {
            tracing::warn!(stream = %stream, batch_id, total, "Batch rejected, no valid items");
            return Err(BroadcastError::EmptyBatch {
                stream,
                rejected: total,
            });
        }
        Ok(Envelope::batch(stream, batch_id, valid))
    }

    /// Enqueue an already validated envelope.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::QueueFull`] or [`BroadcastError::Closed`]
    /// when the message was dropped.
    pub async fn broadcast_envelope(&self, envelope: Envelope) -> Result<(), BroadcastError> {
        self.enqueue(envelope, None).await
    }

    /// Enqueue a session progress snapshot through the progress throttle.
    ///
    /// Returns `true` when the update was enqueued or intentionally
    /// collapsed, `false` when it was rejected or dropped.
    pub async fn broadcast_execution_progress(&self, session_id: &str, progress: Value) -> bool {
        let stream = StreamType::ExecutionProgress;
        let data = with_session_id(session_id, progress);
        if let Err(e) = validate_payload(stream, &data) {
            self.reject(&e);
            return false;
        }

        let terminal = SessionStatus::from_payload(&data).is_some_and(SessionStatus::is_terminal);
        let percentage = data
            .get("progress_percentage")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let decision = self.throttle.check(session_id, percentage, terminal);
        match decision {
            ThrottleDecision::Send => {}
            ThrottleDecision::Collapse => {
                inc(&self.counters.progress_throttled);
                metrics::record_progress_throttled();
                tracing::trace!(session_id, percentage, "Progress update collapsed");
                return true;
            }
            ThrottleDecision::AfterTerminal => {
                inc(&self.counters.progress_after_terminal);
                metrics::record_message_dropped(stream, DropReason::AfterTerminal);
                tracing::debug!(session_id, "Progress after terminal update dropped");
                return true;
            }
        }

        let envelope = Envelope::single(stream, "execution_progress", data);
        if terminal {
            let accepted = self.enqueue_with_retry(envelope).await;
            if accepted {
                self.throttle.seal(session_id);
            }
            accepted
        } else {
            let accepted = self.enqueue(envelope, None).await.is_ok();
            if accepted {
                self.throttle.record_sent(session_id, percentage);
            }
            accepted
        }
    }

    /// Enqueue a session's terminal result, retrying the enqueue with
    /// backoff. Seals the session against later progress updates.
    pub async fn broadcast_execution_result(&self, session_id: &str, result: Value) -> bool {
        let stream = StreamType::ExecutionResult;
        let data = with_session_id(session_id, result);
        if let Err(e) = validate_payload(stream, &data) {
            self.reject(&e);
            return false;
        }

        let accepted = self
            .enqueue_with_retry(Envelope::single(stream, "execution_result", data))
            .await;
        if accepted {
            self.throttle.seal(session_id);
        }
        accepted
    }

    // -------------------------------------------------------------------------
    // Enqueue
    // -------------------------------------------------------------------------

    async fn enqueue(
        &self,
        envelope: Envelope,
        exclude_client: Option<&str>,
    ) -> Result<(), BroadcastError> {
        let stream = envelope.stream;
        match self.try_enqueue(QueuedMessage::new(envelope, exclude_client)).await {
            Ok(()) => Ok(()),
            Err((reason, _)) => {
                self.record_drop(stream, reason);
                Err(match reason {
                    DropReason::QueueFull => BroadcastError::QueueFull { stream },
                    _ => BroadcastError::Closed,
                })
            }
        }
    }

    async fn enqueue_with_retry(&self, envelope: Envelope) -> bool {
        let stream = envelope.stream;
        let mut policy = BackoffPolicy::new(self.config.result_retry);
        let mut message = QueuedMessage::new(envelope, None);

        loop {
            match self.try_enqueue(message).await {
                Ok(()) => return true,
                Err((DropReason::Closed, _)) => {
                    self.record_drop(stream, DropReason::Closed);
                    return false;
                }
                Err((reason, returned)) => {
                    let Some(delay) = policy.next_delay() else {
                        self.record_drop(stream, reason);
                        tracing::error!(
                            stream = %stream,
                            attempts = policy.retries() + 1,
                            "Terminal session message dropped after enqueue retries"
                        );
                        return false;
                    };
                    message = returned;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_enqueue(
        &self,
        message: QueuedMessage,
    ) -> Result<(), (DropReason, QueuedMessage)> {
        if self.stopped.load(Ordering::Acquire) {
            return Err((DropReason::Closed, message));
        }

        let stream = message.stream;
        match self.tx.send_timeout(message, self.config.enqueue_timeout).await {
            Ok(()) => {
                inc(&self.counters.enqueued);
                metrics::record_message_enqueued(stream);
                metrics::set_queue_depth(self.queue_depth());
                Ok(())
            }
            Err(SendTimeoutError::Timeout(m)) => Err((DropReason::QueueFull, m)),
            Err(SendTimeoutError::Closed(m)) => Err((DropReason::Closed, m)),
        }
    }

    fn reject(&self, error: &BroadcastError) {
        inc(&self.counters.validation_failures);
        if let BroadcastError::Validation { stream, .. } = error {
            metrics::record_validation_failure(*stream);
        }
        tracing::warn!(error = %error, "Broadcast rejected");
    }

    fn record_drop(&self, stream: StreamType, reason: DropReason) {
        let counter = match reason {
            DropReason::QueueFull => Some(&self.counters.dropped_queue_full),
            DropReason::Closed => Some(&self.counters.dropped_closed),
            DropReason::RateLimited => Some(&self.counters.rate_limited),
            DropReason::AfterTerminal => Some(&self.counters.progress_after_terminal),
            // Per-client drops are counted by the transport's own stats.
            DropReason::SlowConsumer => None,
        };
        if let Some(counter) = counter {
            inc(counter);
        }
        metrics::record_message_dropped(stream, reason);
        tracing::warn!(stream = %stream, reason = reason.as_str(), "Broadcast message dropped");
    }

    // -------------------------------------------------------------------------
    // Consumer
    // -------------------------------------------------------------------------

    async fn run_consumer(self: Arc<Self>, mut rx: mpsc::Receiver<QueuedMessage>) {
        loop {
            let message = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = self.dispatch(message) => {}
            }
        }

        self.running.store(false, Ordering::Release);
        tracing::debug!("Broadcast consumer exited");
    }

    async fn dispatch(self: &Arc<Self>, message: QueuedMessage) {
        let stream = message.stream;
        let queue_latency = message.enqueued_at.elapsed();
        self.queue_latency.lock().record(queue_latency);
        metrics::record_queue_latency(stream, queue_latency);
        metrics::set_queue_depth(self.queue_depth());

        if !self.config.rate_limit_exempt.contains(&stream)
            && !self
                .limiter
                .acquire_wait(1.0, self.config.rate_limit_max_wait)
                .await
        {
            self.record_drop(stream, DropReason::RateLimited);
            return;
        }

        let started = Instant::now();
        let result = self
            .transport
            .broadcast_to_subscribers(stream, Arc::clone(&message.envelope), message.exclude.clone())
            .await;
        let broadcast_latency = started.elapsed();
        self.broadcast_latency.lock().record(broadcast_latency);
        metrics::record_broadcast_latency(stream, broadcast_latency);

        match result {
            Ok(delivered) => self.record_delivery(stream, delivered),
            Err(e) => {
                inc(&self.counters.transport_errors);
                tracing::warn!(stream = %stream, error = %e, "Transport failed, scheduling retry");
                self.spawn_retry(message);
            }
        }

        self.check_latency(stream, queue_latency + broadcast_latency);
    }

    fn spawn_retry(self: &Arc<Self>, message: QueuedMessage) {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            let stream = message.stream;
            let mut policy = BackoffPolicy::new(this.config.transport_retry);
            let mut last_error = None;

            while let Some(delay) = policy.next_delay() {
                tokio::select! {
                    () = this.cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }

                inc(&this.counters.transport_retries);
                metrics::record_transport_retry(stream);

                let attempt = this.transport.broadcast_to_subscribers(
                    stream,
                    Arc::clone(&message.envelope),
                    message.exclude.clone(),
                );
                let result = tokio::select! {
                    () = this.cancel.cancelled() => return,
                    result = attempt => result,
                };

                match result {
                    Ok(delivered) => {
                        this.record_delivery(stream, delivered);
                        return;
                    }
                    Err(e) => {
                        inc(&this.counters.transport_errors);
                        last_error = Some(e);
                    }
                }
            }

            inc(&this.counters.terminal_failures);
            metrics::record_transport_failure(stream);
            tracing::error!(
                stream = %stream,
                message_type = %message.envelope.message_type,
                batch_id = message.envelope.batch_id.as_deref().unwrap_or(""),
                error = ?last_error,
                "Transport delivery failed after retries"
            );
        });
    }

    fn record_delivery(&self, stream: StreamType, delivered: usize) {
        inc(&self.counters.sent);
        self.counters
            .delivered_clients
            .fetch_add(delivered as u64, Ordering::Relaxed);
        metrics::record_message_sent(stream, delivered);
    }

    fn check_latency(&self, stream: StreamType, total: Duration) {
        let critical = self.config.critical_streams.contains(&stream);
        let threshold = if critical {
            self.config.critical_latency_threshold
        } else {
            self.config.latency_threshold
        };
        if total <= threshold {
            return;
        }

        let latency_ms = total.as_secs_f64() * 1000.0;
        if critical {
            inc(&self.counters.critical_latency_breaches);
            tracing::warn!(
                stream = %stream,
                latency_ms,
                threshold_ms = threshold.as_secs_f64() * 1000.0,
                "Critical stream latency above threshold"
            );
        } else {
            inc(&self.counters.latency_breaches);
            tracing::info!(stream = %stream, latency_ms, "Broadcast latency above threshold");
        }
    }

    async fn run_maintenance(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = self.throttle.prune(self.config.throttle_retention);
                    if pruned > 0 {
                        tracing::debug!(pruned, "Pruned progress throttle entries");
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Broadcaster statistics.
    #[must_use]
    pub fn get_stats(&self) -> BroadcasterStats {
        let c = &self.counters;
        BroadcasterStats {
            running: self.is_running(),
            enqueued: load(&c.enqueued),
            sent: load(&c.sent),
            delivered_clients: load(&c.delivered_clients),
            dropped_queue_full: load(&c.dropped_queue_full),
            dropped_closed: load(&c.dropped_closed),
            rate_limited: load(&c.rate_limited),
            validation_failures: load(&c.validation_failures),
            transport_errors: load(&c.transport_errors),
            transport_retries: load(&c.transport_retries),
            terminal_failures: load(&c.terminal_failures),
            progress_throttled: load(&c.progress_throttled),
            progress_after_terminal: load(&c.progress_after_terminal),
            latency_breaches: load(&c.latency_breaches),
            critical_latency_breaches: load(&c.critical_latency_breaches),
            queue_depth: self.queue_depth(),
            queue_capacity: self.config.max_queue_size,
            queue_latency: self.queue_latency.lock().summary(),
            broadcast_latency: self.broadcast_latency.lock().summary(),
            rate_limiter: self.limiter.stats(),
            throttled_sessions: self.throttle.tracked_sessions(),
        }
    }

    /// Broadcaster health.
    #[must_use]
    pub fn health_check(&self) -> ComponentHealth {
        let stats = self.get_stats();
        let mut health = ComponentHealth::healthy("broadcaster");

        if !stats.running {
            health.fail("broadcaster is not running");
        }

        let dropped = stats.dropped_total();
        let attempted = stats.enqueued + stats.dropped_queue_full + stats.dropped_closed;
        if attempted > 0 {
            #[allow(clippy::cast_precision_loss)]
            let ratio = dropped as f64 / attempted as f64;
            if ratio > 0.5 {
                health.fail(format!("drop ratio {ratio:.2}"));
            } else if ratio > 0.05 {
                health.degrade(format!("drop ratio {ratio:.2}"));
            }
        }

        if stats.queue_depth * 10 >= stats.queue_capacity * 8 {
            health.degrade(format!(
                "queue {}/{} full",
                stats.queue_depth, stats.queue_capacity
            ));
        }
        if stats.terminal_failures > 0 {
            health.degrade(format!(
                "{} deliveries failed after retries",
                stats.terminal_failures
            ));
        }
        health
    }
}

/// Broadcaster statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcasterStats {
    /// Consumer running.
    pub running: bool,
    /// Messages accepted onto the queue.
    pub enqueued: u64,
    /// Messages handed to the transport successfully.
    pub sent: u64,
    /// Sum of clients reached.
    pub delivered_clients: u64,
    /// Dropped: queue full for the whole enqueue timeout.
    pub dropped_queue_full: u64,
    /// Dropped: broadcaster stopped.
    pub dropped_closed: u64,
    /// Dropped: rate limiter wait timed out.
    pub rate_limited: u64,
    /// Rejected by validation.
    pub validation_failures: u64,
    /// Failed transport calls, including retries.
    pub transport_errors: u64,
    /// Transport retries.
    pub transport_retries: u64,
    /// Messages lost after every retry.
    pub terminal_failures: u64,
    /// Progress updates collapsed.
    pub progress_throttled: u64,
    /// Progress updates dropped after the session's terminal update.
    pub progress_after_terminal: u64,
    /// Latency breaches on normal streams.
    pub latency_breaches: u64,
    /// Latency breaches on critical streams.
    pub critical_latency_breaches: u64,
    /// Messages waiting.
    pub queue_depth: usize,
    /// Queue bound.
    pub queue_capacity: usize,
    /// Time spent queued.
    pub queue_latency: LatencySummary,
    /// Time spent in the transport.
    pub broadcast_latency: LatencySummary,
    /// Token bucket state.
    pub rate_limiter: TokenBucketStats,
    /// Sessions with throttle bookkeeping.
    pub throttled_sessions: usize,
}

impl BroadcasterStats {
    /// Messages lost to backpressure, shutdown or rate limiting.
    #[must_use]
    pub const fn dropped_total(&self) -> u64 {
        self.dropped_queue_full + self.dropped_closed + self.rate_limited
    }
}

// =============================================================================
// Tests
// =============================================================================
