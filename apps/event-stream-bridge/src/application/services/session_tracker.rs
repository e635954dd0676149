//! Session Progress Tracker
//!
//! Turns raw `execution.*` lifecycle events into per-session state and
//! re-publishes snapshots on the bus for the broadcaster to deliver.
//!
//! # Ordering
//!
//! Each session has its own async lock. Every mutation and every publish
//! for a session happens under it, so updates apply in arrival order. The
//! terminal event builds the result, publishes it and removes the live
//! entry before releasing the lock; an update racing the terminal event
//! finds the slot empty and is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::application::ports::{EventBusPort, HandlerId, handler_fn};
use crate::domain::health::ComponentHealth;
use crate::domain::session::{
    ExecutionProgress, ExecutionResult, NormalizedEvent, SessionEventKind, SessionStatus,
};
use crate::domain::streaming::Event;
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct SessionTrackerConfig {
    /// Sessions idle for longer than this are evicted.
    pub session_ttl: Duration,
    /// Interval of the TTL sweep.
    pub cleanup_interval: Duration,
    /// Terminal results kept for `recent_results`.
    pub history_size: usize,
    /// Live sessions above which health degrades.
    pub max_active_sessions: usize,
    /// Topic for progress snapshots.
    pub progress_topic: String,
    /// Topic for terminal results.
    pub result_topic: String,
}

impl Default for SessionTrackerConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60),
            history_size: 100,
            max_active_sessions: 1_000,
            progress_topic: "broadcast.execution_progress".to_string(),
            result_topic: "broadcast.execution_result".to_string(),
        }
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug)]
struct SessionSlot {
    /// `None` once the session reached its terminal status.
    progress: Option<ExecutionProgress>,
}

type Slot = Arc<tokio::sync::Mutex<SessionSlot>>;

#[derive(Debug, Default)]
struct Counters {
    events_processed: AtomicU64,
    invalid_events: AtomicU64,
    unknown_session_events: AtomicU64,
    duplicate_sessions: AtomicU64,
    late_updates: AtomicU64,
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    sessions_stopped: AtomicU64,
    sessions_cancelled: AtomicU64,
    sessions_evicted: AtomicU64,
    unrouted_publishes: AtomicU64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Progress snapshot announcing a terminal status.
fn terminal_progress(result: &ExecutionResult) -> Value {
    json!({
        "session_id": result.session_id,
        "status": result.status,
        "progress_percentage": result.progress_percentage,
        "current_step": result.current_step,
        "total_steps": result.total_steps,
        "records_collected": result.records_collected,
        "elapsed_seconds": result.total_duration_seconds,
        "eta_seconds": 0.0,
        "last_update": result.finished_at,
    })
}

// =============================================================================
// Tracker
// =============================================================================

/// Session-keyed progress state machine.
pub struct SessionProgressTracker {
    config: SessionTrackerConfig,
    bus: Arc<dyn EventBusPort>,
    sessions: RwLock<HashMap<String, Slot>>,
    history: Mutex<VecDeque<ExecutionResult>>,
    handler: Mutex<Option<(String, HandlerId)>>,
    running: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
    counters: Counters,
}

impl SessionProgressTracker {
    /// Pattern of the lifecycle topics the tracker consumes.
    pub const EVENT_PATTERN: &'static str = "execution.*";

    /// Create a tracker publishing snapshots on `bus`.
    #[must_use]
    pub fn new(config: SessionTrackerConfig, bus: Arc<dyn EventBusPort>) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            config,
            bus,
            sessions: RwLock::new(HashMap::new()),
            handler: Mutex::new(None),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            counters: Counters::default(),
        }
    }

    /// Subscribe to lifecycle topics and spawn the TTL sweep.
    ///
    /// Returns `false` if already started or stopped.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.stopped.load(Ordering::Acquire) || self.running.swap(true, Ordering::AcqRel) {
            return false;
        }

        let tracker: Weak<Self> = Arc::downgrade(self);
        let handler = handler_fn(move |event: Event| {
            let tracker = tracker.clone();
            async move {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.process_execution_event(&event.topic, &event.payload).await;
                }
            }
        });
        let id = self.bus.subscribe(Self::EVENT_PATTERN, handler);
        *self.handler.lock() = Some((Self::EVENT_PATTERN.to_string(), id));

        let this = Arc::clone(self);
        self.tasks.spawn(async move { this.run_sweep().await });

        tracing::info!(
            ttl_secs = self.config.session_ttl.as_secs(),
            history = self.config.history_size,
            "Session progress tracker started"
        );
        true
    }

    /// Unsubscribe and stop the sweep. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some((pattern, id)) = self.handler.lock().take() {
            self.bus.unsubscribe(&pattern, id);
        }
        self.cancel.cancel();
        self.tasks.close();
        if tokio::time::timeout(Duration::from_secs(1), self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!("Session sweep did not stop in time");
        }

        self.running.store(false, Ordering::Release);
        tracing::info!(active = self.sessions.read().len(), "Session progress tracker stopped");
    }

    /// Whether the tracker is consuming events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Event processing
    // -------------------------------------------------------------------------

    /// Apply one lifecycle event.
    ///
    /// `event_type` is the event name or its `execution.<name>` topic.
    /// Returns `true` when session state changed. Unknown, duplicate and
    /// malformed events are logged and dropped.
    pub async fn process_execution_event(&self, event_type: &str, event_data: &Value) -> bool {
        inc(&self.counters.events_processed);

        let Ok(kind) = event_type.parse::<SessionEventKind>() else {
            inc(&self.counters.invalid_events);
            tracing::warn!(event_type, "Unknown execution event type");
            return false;
        };

        let event = NormalizedEvent::new(event_data);
        let Some(session_id) = event.session_id() else {
            inc(&self.counters.invalid_events);
            tracing::warn!(event_type = kind.as_str(), "Execution event without session_id");
            return false;
        };

        match kind.terminal_status() {
            Some(status) => self.finish_session(&session_id, status, &event).await,
            None if kind == SessionEventKind::SessionStarted => {
                self.start_session(&session_id, &event).await
            }
            None => self.update_session(&session_id, &event).await,
        }
    }

    async fn start_session(&self, session_id: &str, event: &NormalizedEvent) -> bool {
        let slot: Slot = Arc::new(tokio::sync::Mutex::new(SessionSlot { progress: None }));
        // Lock before publishing the slot so no update can slip in ahead.
        let mut guard = Arc::clone(&slot).lock_owned().await;

        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(session_id) {
                drop(sessions);
                inc(&self.counters.duplicate_sessions);
                tracing::warn!(session_id, "Duplicate session_started ignored");
                return false;
            }
            sessions.insert(session_id.to_string(), slot);
            metrics::set_active_sessions(sessions.len());
        }

        let progress = ExecutionProgress::start(session_id, event);
        let snapshot = progress.snapshot();
        tracing::info!(
            session_id,
            kind = ?progress.kind,
            total_steps = progress.total_steps,
            "Execution session started"
        );
        guard.progress = Some(progress);

        inc(&self.counters.sessions_started);
        metrics::record_session_started();
        self.publish(&self.config.progress_topic, snapshot).await;
        true
    }

    async fn update_session(&self, session_id: &str, event: &NormalizedEvent) -> bool {
        let Some(slot) = self.slot(session_id) else {
            inc(&self.counters.unknown_session_events);
            tracing::warn!(session_id, "Progress update for unknown session dropped");
            return false;
        };

        let mut guard = slot.lock().await;
        let Some(progress) = guard.progress.as_mut() else {
            inc(&self.counters.late_updates);
            tracing::warn!(session_id, "Progress update after terminal status dropped");
            return false;
        };

        progress.apply(event);
        let snapshot = progress.snapshot();
        tracing::debug!(
            session_id,
            percentage = progress.progress_percentage,
            records = progress.records_collected,
            "Session progress"
        );
        self.publish(&self.config.progress_topic, snapshot).await;
        true
    }

    async fn finish_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        event: &NormalizedEvent,
    ) -> bool {
        let Some(slot) = self.slot(session_id) else {
            inc(&self.counters.unknown_session_events);
            tracing::warn!(session_id, status = %status, "Terminal event for unknown session dropped");
            return false;
        };

        let mut guard = slot.lock().await;
        let Some(progress) = guard.progress.take() else {
            inc(&self.counters.late_updates);
            tracing::warn!(session_id, status = %status, "Duplicate terminal event dropped");
            return false;
        };

        let result = progress.finish(status, event);
        self.publish(&self.config.progress_topic, terminal_progress(&result))
            .await;
        self.publish(&self.config.result_topic, result.snapshot()).await;

        {
            let mut sessions = self.sessions.write();
            sessions.remove(session_id);
            metrics::set_active_sessions(sessions.len());
        }

        let counter = match status {
            SessionStatus::Failed => &self.counters.sessions_failed,
            SessionStatus::Stopped => &self.counters.sessions_stopped,
            SessionStatus::Cancelled => &self.counters.sessions_cancelled,
            _ => &self.counters.sessions_completed,
        };
        inc(counter);
        metrics::record_session_finished(status.as_str());

        if status == SessionStatus::Failed {
            tracing::warn!(
                session_id,
                duration_secs = result.total_duration_seconds,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Execution session failed"
            );
        } else {
            tracing::info!(
                session_id,
                status = %status,
                duration_secs = result.total_duration_seconds,
                "Execution session finished"
            );
        }

        let mut history = self.history.lock();
        if history.len() >= self.config.history_size {
            history.pop_front();
        }
        if self.config.history_size > 0 {
            history.push_back(result);
        }
        drop(history);
        drop(guard);
        true
    }

    fn slot(&self, session_id: &str) -> Option<Slot> {
        self.sessions.read().get(session_id).cloned()
    }

    async fn publish(&self, topic: &str, payload: Value) {
        if self.bus.publish(topic, payload).await == 0 {
            inc(&self.counters.unrouted_publishes);
            tracing::debug!(topic, "Session snapshot reached no handler");
        }
    }

    // -------------------------------------------------------------------------
    // TTL sweep
    // -------------------------------------------------------------------------

    /// Evict sessions idle for longer than the TTL. Sessions whose lock is
    /// held are skipped. Returns the number evicted.
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.config.session_ttl;
        let mut sessions = self.sessions.write();
        let before = sessions.len();

        sessions.retain(|session_id, slot| {
            let Ok(guard) = slot.try_lock() else {
                return true;
            };
            match guard.progress.as_ref() {
                Some(progress) if progress.idle() > ttl => {
                    tracing::warn!(
                        session_id,
                        idle_secs = progress.idle().as_secs(),
                        percentage = progress.progress_percentage,
                        "Evicting stale execution session"
                    );
                    false
                }
                Some(_) => true,
                None => false,
            }
        });

        let evicted = before - sessions.len();
        if evicted > 0 {
            self.counters
                .sessions_evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            metrics::record_sessions_evicted(evicted);
            metrics::set_active_sessions(sessions.len());
        }
        evicted
    }

    async fn run_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_expired();
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current snapshot of a live session.
    pub async fn get_session_progress(&self, session_id: &str) -> Option<Value> {
        let slot = self.slot(session_id)?;
        let guard = slot.lock().await;
        guard.progress.as_ref().map(ExecutionProgress::snapshot)
    }

    /// Ids of live sessions, sorted.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Most recent terminal results, newest first.
    #[must_use]
    pub fn recent_results(&self, limit: usize) -> Vec<ExecutionResult> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Tracker statistics.
    #[must_use]
    pub fn get_stats(&self) -> TrackerStats {
        let c = &self.counters;
        TrackerStats {
            running: self.is_running(),
            active_sessions: self.sessions.read().len(),
            history_len: self.history.lock().len(),
            events_processed: load(&c.events_processed),
            invalid_events: load(&c.invalid_events),
            unknown_session_events: load(&c.unknown_session_events),
            duplicate_sessions: load(&c.duplicate_sessions),
            late_updates: load(&c.late_updates),
            sessions_started: load(&c.sessions_started),
            sessions_completed: load(&c.sessions_completed),
            sessions_failed: load(&c.sessions_failed),
            sessions_stopped: load(&c.sessions_stopped),
            sessions_cancelled: load(&c.sessions_cancelled),
            sessions_evicted: load(&c.sessions_evicted),
            unrouted_publishes: load(&c.unrouted_publishes),
        }
    }

    /// Tracker health.
    #[must_use]
    pub fn health_check(&self) -> ComponentHealth {
        let stats = self.get_stats();
        let mut health = ComponentHealth::healthy("session_tracker");
        if !stats.running {
            health.fail("session tracker is not running");
        }
        if stats.active_sessions > self.config.max_active_sessions {
            health.degrade(format!(
                "{} active sessions above limit {}",
                stats.active_sessions, self.config.max_active_sessions
            ));
        }
        health
    }
}

/// Tracker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    /// Consuming events.
    pub running: bool,
    /// Live sessions.
    pub active_sessions: usize,
    /// Results in the history buffer.
    pub history_len: usize,
    /// Lifecycle events seen.
    pub events_processed: u64,
    /// Events with an unknown type or no session id.
    pub invalid_events: u64,
    /// Events for sessions not being tracked.
    pub unknown_session_events: u64,
    /// Repeated `session_started` events.
    pub duplicate_sessions: u64,
    /// Events arriving after the session's terminal event.
    pub late_updates: u64,
    /// Sessions started.
    pub sessions_started: u64,
    /// Sessions completed.
    pub sessions_completed: u64,
    /// Sessions failed.
    pub sessions_failed: u64,
    /// Sessions stopped.
    pub sessions_stopped: u64,
    /// Sessions cancelled.
    pub sessions_cancelled: u64,
    /// Sessions evicted by the TTL sweep.
    pub sessions_evicted: u64,
    /// Snapshots published with no handler listening.
    pub unrouted_publishes: u64,
}

// =============================================================================
// Tests
// =============================================================================
