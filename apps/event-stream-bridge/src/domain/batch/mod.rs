//! Batch Aggregation
//!
//! Accumulates keyed updates for one stream into size/age bounded batches.
//!
//! # Semantics
//!
//! - Last write wins per key inside the open batch
//! - The open batch is flushed when it holds `max_batch_size` keys or when
//!   its first update is `flush_interval` old
//! - Flushed batches wait in a bounded FIFO; when it is full the oldest
//!   flushed batch is dropped so producers never block

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::streaming::StreamType;

// =============================================================================
// Policy
// =============================================================================

/// Invalid batch policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BatchPolicyError {
    /// `max_batch_size` must be at least 1.
    #[error("max_batch_size must be at least 1")]
    ZeroBatchSize,
    /// `flush_interval` must be non-zero.
    #[error("flush_interval must be non-zero")]
    ZeroFlushInterval,
    /// `max_pending_batches` must be at least 1.
    #[error("max_pending_batches must be at least 1")]
    ZeroPendingBatches,
}

/// Flush triggers and queue bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Flush when the open batch holds this many keys.
    pub max_batch_size: usize,
    /// Flush when the oldest update in the open batch is this old.
    pub flush_interval: Duration,
    /// Bound on flushed batches awaiting dispatch.
    pub max_pending_batches: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            flush_interval: Duration::from_millis(100),
            max_pending_batches: 100,
        }
    }
}

impl BatchPolicy {
    /// Check the policy.
    ///
    /// # Errors
    ///
    /// Returns the first zero-valued bound.
    pub const fn validate(&self) -> Result<(), BatchPolicyError> {
        if self.max_batch_size == 0 {
            return Err(BatchPolicyError::ZeroBatchSize);
        }
        if self.flush_interval.is_zero() {
            return Err(BatchPolicyError::ZeroFlushInterval);
        }
        if self.max_pending_batches == 0 {
            return Err(BatchPolicyError::ZeroPendingBatches);
        }
        Ok(())
    }
}

// =============================================================================
// Batch Update
// =============================================================================

/// A keyed set of updates. Item order is first-insertion order of each key.
#[derive(Debug, Clone)]
pub struct BatchUpdate {
    /// Batch identifier.
    pub batch_id: Uuid,
    /// Stream the updates belong to.
    pub stream: StreamType,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
    first_insert: Option<Instant>,
    index: HashMap<String, usize>,
    items: Vec<(String, Value)>,
}

impl BatchUpdate {
    fn open(stream: StreamType) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            stream,
            created_at: Utc::now(),
            first_insert: None,
            index: HashMap::new(),
            items: Vec::new(),
        }
    }

    /// Insert or replace the value for `key`. Returns `true` if an existing
    /// value was replaced.
    fn upsert(&mut self, key: String, data: Value) -> bool {
        if self.first_insert.is_none() {
            self.first_insert = Some(Instant::now());
        }

        if let Some(&pos) = self.index.get(&key) {
            self.items[pos].1 = data;
            return true;
        }

        self.index.insert(key.clone(), self.items.len());
        self.items.push((key, data));
        false
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no update has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Time since the first insert. Zero for an empty batch.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.first_insert.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|(k, _)| k.as_str())
    }

    /// Value stored for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.index.get(key).map(|&pos| &self.items[pos].1)
    }

    /// Consume the batch, returning the payloads in insertion order.
    #[must_use]
    pub fn into_items(self) -> Vec<Value> {
        self.items.into_iter().map(|(_, v)| v).collect()
    }
}

// =============================================================================
// Aggregator
// =============================================================================

/// What a flush attempt did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// The open batch moved to the pending queue.
    pub flushed: bool,
    /// The oldest pending batch was dropped to make room.
    pub dropped_oldest: bool,
}

#[derive(Debug)]
struct AggregatorState {
    open: BatchUpdate,
    pending: VecDeque<BatchUpdate>,
    updates: u64,
    merged: u64,
    flushed: u64,
    dropped: u64,
}

/// Per-stream batch aggregator.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use event_stream_bridge::domain::batch::{BatchAggregator, BatchPolicy};
/// use event_stream_bridge::domain::streaming::StreamType;
/// use serde_json::json;
///
/// let policy = BatchPolicy {
///     max_batch_size: 2,
///     flush_interval: Duration::from_secs(1),
///     max_pending_batches: 4,
/// };
/// let aggregator = BatchAggregator::new(StreamType::MarketData, policy).unwrap();
///
/// aggregator.add_update("BTC", json!({"symbol": "BTC", "price": 1}));
/// aggregator.add_update("BTC", json!({"symbol": "BTC", "price": 2}));
/// aggregator.add_update("ETH", json!({"symbol": "ETH", "price": 3}));
///
/// let batch = aggregator.pop_ready().unwrap();
/// assert_eq!(batch.len(), 2);
/// assert_eq!(batch.get("BTC").unwrap()["price"], 2);
/// ```
#[derive(Debug)]
pub struct BatchAggregator {
    stream: StreamType,
    policy: BatchPolicy,
    state: Mutex<AggregatorState>,
    ready: Notify,
}

impl BatchAggregator {
    /// Create an aggregator.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy has a zero bound.
    pub fn new(stream: StreamType, policy: BatchPolicy) -> Result<Self, BatchPolicyError> {
        policy.validate()?;
        Ok(Self {
            stream,
            policy,
            state: Mutex::new(AggregatorState {
                open: BatchUpdate::open(stream),
                pending: VecDeque::with_capacity(policy.max_pending_batches),
                updates: 0,
                merged: 0,
                flushed: 0,
                dropped: 0,
            }),
            ready: Notify::new(),
        })
    }

    /// Stream this aggregator batches.
    #[must_use]
    pub const fn stream(&self) -> StreamType {
        self.stream
    }

    /// Active policy.
    #[must_use]
    pub const fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    /// Merge an update into the open batch, flushing it if a trigger fired.
    pub fn add_update(&self, key: impl Into<String>, data: Value) -> FlushOutcome {
        let mut state = self.state.lock();
        state.updates += 1;
        if state.open.upsert(key.into(), data) {
            state.merged += 1;
        }

        let due = state.open.len() >= self.policy.max_batch_size
            || state.open.age() >= self.policy.flush_interval;
        if due {
            return self.flush_locked(&mut state);
        }
        FlushOutcome::default()
    }

    /// Flush the open batch if it is non-empty and older than the interval.
    pub fn flush_if_due(&self) -> FlushOutcome {
        let mut state = self.state.lock();
        if state.open.is_empty() || state.open.age() < self.policy.flush_interval {
            return FlushOutcome::default();
        }
        self.flush_locked(&mut state)
    }

    /// Flush the open batch regardless of triggers. Used at shutdown.
    pub fn force_flush(&self) -> FlushOutcome {
        let mut state = self.state.lock();
        if state.open.is_empty() {
            return FlushOutcome::default();
        }
        self.flush_locked(&mut state)
    }

    /// Pop the oldest flushed batch.
    #[must_use]
    pub fn pop_ready(&self) -> Option<BatchUpdate> {
        self.state.lock().pending.pop_front()
    }

    /// Number of flushed batches awaiting dispatch.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Wait until a batch has been flushed.
    ///
    /// A flush that happens while nobody waits is remembered, so a
    /// subsequent call returns immediately.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    /// Aggregator statistics.
    #[must_use]
    pub fn stats(&self) -> AggregatorStats {
        let state = self.state.lock();
        AggregatorStats {
            stream: self.stream,
            open_size: state.open.len(),
            pending_batches: state.pending.len(),
            updates: state.updates,
            merged_updates: state.merged,
            batches_flushed: state.flushed,
            batches_dropped: state.dropped,
        }
    }

    fn flush_locked(&self, state: &mut AggregatorState) -> FlushOutcome {
        let batch = std::mem::replace(&mut state.open, BatchUpdate::open(self.stream));
        let mut dropped_oldest = false;

        if state.pending.len() >= self.policy.max_pending_batches
            && let Some(oldest) = state.pending.pop_front()
        {
            state.dropped += 1;
            dropped_oldest = true;
            tracing::warn!(
                stream = %self.stream,
                batch_id = %oldest.batch_id,
                items = oldest.len(),
                "Batch queue full, dropping oldest batch"
            );
        }

        tracing::trace!(stream = %self.stream, batch_id = %batch.batch_id, items = batch.len(), "Batch flushed");
        state.pending.push_back(batch);
        state.flushed += 1;
        self.ready.notify_one();

        FlushOutcome {
            flushed: true,
            dropped_oldest,
        }
    }
}

/// Aggregator statistics.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStats {
    /// Aggregated stream.
    pub stream: StreamType,
    /// Keys in the open batch.
    pub open_size: usize,
    /// Flushed batches awaiting dispatch.
    pub pending_batches: usize,
    /// Total `add_update` calls.
    pub updates: u64,
    /// Updates that replaced an existing key.
    pub merged_updates: u64,
    /// Batches flushed.
    pub batches_flushed: u64,
    /// Flushed batches dropped because the queue was full.
    pub batches_dropped: u64,
}

// =============================================================================
// Tests
// =============================================================================
