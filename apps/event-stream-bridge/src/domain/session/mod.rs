//! Execution Session Model
//!
//! Per-session progress state and the immutable terminal result.
//!
//! # Lifecycle
//!
//! ```text
//! session_started ──► Created ──progress_update──► Running ──┬──► Completed
//!                                                            ├──► Failed
//!                                                            ├──► Stopped
//!                                                            └──► Cancelled
//! ```

mod normalize;
mod throttle;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

pub use normalize::{NormalizedEvent, bars_per_day, estimate_total_steps};
pub use throttle::{ProgressThrottle, ThrottleDecision};

// =============================================================================
// Status
// =============================================================================

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Started, no progress reported yet.
    Created,
    /// At least one progress update received.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by the operator.
    Stopped,
    /// Cancelled before completion.
    Cancelled,
}

impl SessionStatus {
    /// Whether no further updates are expected.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Cancelled
        )
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Cancelled => "cancelled",
        }
    }

    /// Read the status from a payload's `status` field.
    #[must_use]
    pub fn from_payload(data: &Value) -> Option<Self> {
        data.get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = UnknownSessionEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "created" | "started" | "pending" => Ok(Self::Created),
            "running" | "in_progress" => Ok(Self::Running),
            "completed" | "complete" | "success" => Ok(Self::Completed),
            "failed" | "error" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(UnknownSessionEvent(s.to_string())),
        }
    }
}

// =============================================================================
// Event Kind
// =============================================================================

/// Session lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    /// Creates the session.
    SessionStarted,
    /// Mutates a live session.
    ProgressUpdate,
    /// Terminal: success.
    SessionCompleted,
    /// Terminal: error.
    SessionFailed,
    /// Terminal: stopped.
    SessionStopped,
    /// Terminal: cancelled.
    SessionCancelled,
}

/// Unrecognised session event or status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown session event: {0}")]
pub struct UnknownSessionEvent(pub String);

impl SessionEventKind {
    /// Prefix of every session lifecycle topic.
    pub const TOPIC_PREFIX: &'static str = "execution";

    /// All event kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::SessionStarted,
            Self::ProgressUpdate,
            Self::SessionCompleted,
            Self::SessionFailed,
            Self::SessionStopped,
            Self::SessionCancelled,
        ]
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::ProgressUpdate => "progress_update",
            Self::SessionCompleted => "session_completed",
            Self::SessionFailed => "session_failed",
            Self::SessionStopped => "session_stopped",
            Self::SessionCancelled => "session_cancelled",
        }
    }

    /// Bus topic carrying this event kind.
    #[must_use]
    pub fn topic(self) -> String {
        format!("{}.{}", Self::TOPIC_PREFIX, self.as_str())
    }

    /// Status reached by a terminal event.
    #[must_use]
    pub const fn terminal_status(self) -> Option<SessionStatus> {
        match self {
            Self::SessionCompleted => Some(SessionStatus::Completed),
            Self::SessionFailed => Some(SessionStatus::Failed),
            Self::SessionStopped => Some(SessionStatus::Stopped),
            Self::SessionCancelled => Some(SessionStatus::Cancelled),
            Self::SessionStarted | Self::ProgressUpdate => None,
        }
    }
}

impl FromStr for SessionEventKind {
    type Err = UnknownSessionEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.rsplit('.').next().unwrap_or(s);
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| UnknownSessionEvent(s.to_string()))
    }
}

impl fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Session Kind
// =============================================================================

/// How a session measures progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Step-based replay over a date range.
    Backtest,
    /// Open-ended collection counting records.
    Collection,
    /// Anything else; percentage only.
    Generic,
}

impl SessionKind {
    /// Classify by the `command_type` field.
    #[must_use]
    pub fn from_command_type(command_type: Option<&str>) -> Self {
        match command_type.map(str::to_lowercase).as_deref() {
            Some(c) if c.contains("collect") => Self::Collection,
            Some(c) if c.contains("backtest") || c.contains("optimi") => Self::Backtest,
            _ => Self::Generic,
        }
    }
}

// =============================================================================
// Execution Progress
// =============================================================================

/// Live state of one session.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionProgress {
    /// Session identifier.
    pub session_id: String,
    /// Progress model.
    pub kind: SessionKind,
    /// Command that started the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
    /// Current status.
    pub status: SessionStatus,
    /// Percentage in `[0, 100]`.
    pub progress_percentage: f64,
    /// Steps completed.
    pub current_step: u64,
    /// Estimated or reported total steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u64>,
    /// Records collected so far. Never decreases.
    pub records_collected: u64,
    /// Estimated seconds remaining.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    /// Latest human-readable status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Latest performance metrics.
    pub performance_metrics: Map<String, Value>,
    /// Latest trading statistics.
    pub trading_stats: Map<String, Value>,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock time of the last update.
    pub last_update: DateTime<Utc>,
    #[serde(skip)]
    session_start: Instant,
    #[serde(skip)]
    last_touch: Instant,
}

impl ExecutionProgress {
    /// Create state from a `session_started` event.
    #[must_use]
    pub fn start(session_id: impl Into<String>, event: &NormalizedEvent) -> Self {
        let now = Instant::now();
        let command_type = event.command_type();
        let kind = SessionKind::from_command_type(command_type.as_deref());
        let total_steps = event.total_steps().or_else(|| {
            (kind == SessionKind::Backtest)
                .then(|| event.estimated_total_steps())
                .flatten()
        });

        let mut progress = Self {
            session_id: session_id.into(),
            kind,
            command_type,
            status: SessionStatus::Created,
            progress_percentage: 0.0,
            current_step: 0,
            total_steps,
            records_collected: 0,
            eta_seconds: None,
            status_message: None,
            performance_metrics: Map::new(),
            trading_stats: Map::new(),
            started_at: Utc::now(),
            last_update: Utc::now(),
            session_start: now,
            last_touch: now,
        };
        progress.merge(event);
        progress.status = SessionStatus::Created;
        progress
    }

    /// Merge a `progress_update` event.
    pub fn apply(&mut self, event: &NormalizedEvent) {
        self.merge(event);
        self.status = SessionStatus::Running;
    }

    fn merge(&mut self, event: &NormalizedEvent) {
        if let Some(total) = event.total_steps() {
            self.total_steps = Some(total);
        }
        if let Some(step) = event.current_step() {
            self.current_step = step;
        }
        if let Some(records) = event.records_collected() {
            self.records_collected = self.records_collected.max(records);
        }
        if let Some(message) = event.status_message() {
            self.status_message = Some(message);
        }
        if let Some(metrics) = event.object("performance_metrics") {
            self.performance_metrics.extend(metrics);
        }
        if let Some(stats) = event.object("trading_stats") {
            self.trading_stats.extend(stats);
        }

        self.progress_percentage = event
            .percentage()
            .or_else(|| self.step_percentage())
            .unwrap_or(self.progress_percentage);

        self.eta_seconds = event.eta_seconds().or_else(|| self.estimated_eta());
        self.last_update = Utc::now();
        self.last_touch = Instant::now();
    }

    fn step_percentage(&self) -> Option<f64> {
        let total = self.total_steps.filter(|t| *t > 0)?;
        #[allow(clippy::cast_precision_loss)]
        let pct = self.current_step as f64 / total as f64 * 100.0;
        Some(pct.clamp(0.0, 100.0))
    }

    fn estimated_eta(&self) -> Option<f64> {
        let p = self.progress_percentage;
        if p <= 0.0 {
            return None;
        }
        let elapsed = self.elapsed().as_secs_f64();
        Some((elapsed * (100.0 - p) / p).max(0.0))
    }

    /// Time since the session started. Measured from the immutable start
    /// instant, never from `last_update`.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.session_start.elapsed()
    }

    /// Time since the last event touched this session.
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.last_touch.elapsed()
    }

    /// Client-facing snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert(
                "elapsed_seconds".to_string(),
                Value::from(self.elapsed().as_secs_f64()),
            );
        }
        value
    }

    /// Freeze the session into its terminal result.
    #[must_use]
    pub fn finish(mut self, status: SessionStatus, event: &NormalizedEvent) -> ExecutionResult {
        self.merge(event);
        self.status = status;
        if status == SessionStatus::Completed {
            self.progress_percentage = 100.0;
            self.eta_seconds = Some(0.0);
        }

        let total_duration_seconds = self.elapsed().as_secs_f64();
        let error = event.error().or_else(|| {
            (status == SessionStatus::Failed)
                .then(|| self.status_message.clone())
                .flatten()
        });

        ExecutionResult {
            session_id: self.session_id.clone(),
            kind: self.kind,
            command_type: self.command_type.clone(),
            status,
            started_at: self.started_at,
            finished_at: Utc::now(),
            total_duration_seconds,
            progress_percentage: self.progress_percentage,
            records_collected: self.records_collected,
            current_step: self.current_step,
            total_steps: self.total_steps,
            performance_metrics: self.performance_metrics,
            trading_stats: self.trading_stats,
            final_payload: event.fields().clone(),
            error,
        }
    }
}

// =============================================================================
// Execution Result
// =============================================================================

/// Immutable terminal snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Session identifier.
    pub session_id: String,
    /// Progress model.
    pub kind: SessionKind,
    /// Command that started the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
    /// Terminal status.
    pub status: SessionStatus,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end.
    pub finished_at: DateTime<Utc>,
    /// Duration from the recorded start.
    pub total_duration_seconds: f64,
    /// Final percentage.
    pub progress_percentage: f64,
    /// Final records count.
    pub records_collected: u64,
    /// Final step.
    pub current_step: u64,
    /// Final total steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u64>,
    /// Final performance metrics.
    pub performance_metrics: Map<String, Value>,
    /// Final trading statistics.
    pub trading_stats: Map<String, Value>,
    /// Flattened terminal event payload.
    pub final_payload: Map<String, Value>,
    /// Error description for failed sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Client-facing snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
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

    #[test_case("session_started", Some(SessionEventKind::SessionStarted) ; "bare")]
    #[test_case("execution.session_failed", Some(SessionEventKind::SessionFailed) ; "topic form")]
    #[test_case("session_exploded", None ; "unknown")]
    fn event_kind_parsing(raw: &str, expected: Option<SessionEventKind>) {
        assert_eq!(raw.parse::<SessionEventKind>().ok(), expected);
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert_eq!(
            SessionEventKind::SessionStopped.terminal_status(),
            Some(SessionStatus::Stopped)
        );
        assert_eq!(SessionEventKind::ProgressUpdate.topic(), "execution.progress_update");
    }

    #[test]
    fn status_from_payload_accepts_aliases() {
        assert_eq!(
            SessionStatus::from_payload(&json!({"status": "Canceled"})),
            Some(SessionStatus::Cancelled)
        );
        assert_eq!(SessionStatus::from_payload(&json!({})), None);
    }

    #[test]
    fn session_kind_classification() {
        assert_eq!(SessionKind::from_command_type(Some("collect")), SessionKind::Collection);
        assert_eq!(
            SessionKind::from_command_type(Some("run_backtest")),
            SessionKind::Backtest
        );
        assert_eq!(SessionKind::from_command_type(None), SessionKind::Generic);
    }

    #[tokio::test(start_paused = true)]
    async fn records_collected_is_monotonic() {
        let start = NormalizedEvent::new(&json!({"session_id": "s", "command_type": "collect"}));
        let mut progress = ExecutionProgress::start("s", &start);

        progress.apply(&NormalizedEvent::new(&json!({"records_collected": 20})));
        progress.apply(&NormalizedEvent::new(&json!({"records_collected": 10})));

        assert_eq!(progress.records_collected, 20);
        assert_eq!(progress.status, SessionStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn percentage_derived_from_steps_with_eta() {
        let start = NormalizedEvent::new(&json!({"command_type": "backtest", "total_steps": 200}));
        let mut progress = ExecutionProgress::start("s", &start);

        tokio::time::advance(Duration::from_secs(10)).await;
        progress.apply(&NormalizedEvent::new(&json!({"current_step": 50})));

        assert!((progress.progress_percentage - 25.0).abs() < 1e-9);
        let eta = progress.eta_seconds.unwrap();
        assert!((eta - 30.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_uses_immutable_start() {
        let start = NormalizedEvent::new(&json!({"command_type": "collect"}));
        let mut progress = ExecutionProgress::start("s", &start);

        tokio::time::advance(Duration::from_secs(5)).await;
        progress.apply(&NormalizedEvent::new(&json!({"records_collected": 3})));
        tokio::time::advance(Duration::from_secs(2)).await;

        let result = progress.finish(SessionStatus::Completed, &NormalizedEvent::new(&json!({})));
        assert!((result.total_duration_seconds - 7.0).abs() < 1e-6);
        assert!((result.progress_percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(result.records_collected, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_result_carries_error() {
        let progress = ExecutionProgress::start("s", &NormalizedEvent::new(&json!({})));
        let result = progress.finish(
            SessionStatus::Failed,
            &NormalizedEvent::new(&json!({"error": "feed unavailable"})),
        );

        assert_eq!(result.error.as_deref(), Some("feed unavailable"));
        assert_eq!(result.snapshot()["status"], "failed");
    }
}
