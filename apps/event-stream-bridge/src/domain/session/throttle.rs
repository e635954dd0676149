//! Progress broadcast throttle.
//!
//! Collapses near-duplicate non-terminal progress updates per session.
//! Terminal updates always pass. Once one is accepted the session is
//! sealed so that a late snapshot cannot follow it. State is recorded only
//! for updates that actually reached the broadcast queue.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Outcome of a throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Forward the update.
    Send,
    /// Near-duplicate within the interval; skip it.
    Collapse,
    /// The session already sent its terminal update; drop it.
    AfterTerminal,
}

#[derive(Debug, Clone, Copy)]
struct LastSent {
    at: Instant,
    percentage: f64,
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_sent: HashMap<String, LastSent>,
    sealed: HashMap<String, Instant>,
}

/// Per-session progress throttle.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    min_delta: f64,
    state: Mutex<ThrottleState>,
}

impl ProgressThrottle {
    /// Create a throttle that collapses updates arriving within `interval`
    /// of the last forwarded one unless the percentage moved by at least
    /// `min_delta` points.
    #[must_use]
    pub fn new(interval: Duration, min_delta: f64) -> Self {
        Self {
            interval,
            min_delta,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    /// Decide whether an update should be forwarded. Nothing is recorded
    /// until [`ProgressThrottle::record_sent`] or [`ProgressThrottle::seal`].
    #[must_use]
    pub fn check(&self, session_id: &str, percentage: f64, terminal: bool) -> ThrottleDecision {
        if terminal {
            return ThrottleDecision::Send;
        }

        let now = Instant::now();
        let state = self.state.lock();
        if state.sealed.contains_key(session_id) {
            return ThrottleDecision::AfterTerminal;
        }

        if let Some(last) = state.last_sent.get(session_id) {
            let recent = now.saturating_duration_since(last.at) < self.interval;
            let moved = (percentage - last.percentage).abs() >= self.min_delta;
            if recent && !moved {
                return ThrottleDecision::Collapse;
            }
        }
        ThrottleDecision::Send
    }

    /// Record a non-terminal update that reached the broadcast queue.
    pub fn record_sent(&self, session_id: &str, percentage: f64) {
        let mut state = self.state.lock();
        if state.sealed.contains_key(session_id) {
            return;
        }
        state.last_sent.insert(
            session_id.to_string(),
            LastSent {
                at: Instant::now(),
                percentage,
            },
        );
    }

    /// Record an accepted terminal update. Later non-terminal updates for
    /// the session are refused.
    pub fn seal(&self, session_id: &str) {
        let mut state = self.state.lock();
        state.last_sent.remove(session_id);
        state.sealed.insert(session_id.to_string(), Instant::now());
    }

    /// Drop bookkeeping older than `max_age`. Returns the number of entries
    /// removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.last_sent.len() + state.sealed.len();

        state
            .last_sent
            .retain(|_, last| now.saturating_duration_since(last.at) < max_age);
        state
            .sealed
            .retain(|_, at| now.saturating_duration_since(*at) < max_age);

        before - state.last_sent.len() - state.sealed.len()
    }

    /// Number of sessions with throttle bookkeeping.
    #[must_use]
    pub fn tracked_sessions(&self) -> usize {
        let state = self.state.lock();
        state.last_sent.len() + state.sealed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> ProgressThrottle {
        ProgressThrottle::new(Duration::from_millis(500), 5.0)
    }

    /// Check and, when forwarded, record the way the broadcaster does after
    /// a successful enqueue.
    fn offer(
        t: &ProgressThrottle,
        session_id: &str,
        percentage: f64,
        terminal: bool,
    ) -> ThrottleDecision {
        let decision = t.check(session_id, percentage, terminal);
        if decision == ThrottleDecision::Send {
            if terminal {
                t.seal(session_id);
            } else {
                t.record_sent(session_id, percentage);
            }
        }
        decision
    }

    #[tokio::test(start_paused = true)]
    async fn collapses_small_moves_within_interval() {
        let t = throttle();
        assert_eq!(offer(&t, "s", 10.0, false), ThrottleDecision::Send);
        assert_eq!(offer(&t, "s", 12.0, false), ThrottleDecision::Collapse);
        assert_eq!(offer(&t, "s", 15.0, false), ThrottleDecision::Send);
    }

    #[tokio::test(start_paused = true)]
    async fn sends_again_after_interval() {
        let t = throttle();
        assert_eq!(offer(&t, "s", 10.0, false), ThrottleDecision::Send);
        tokio::time::advance(Duration::from_millis(501)).await;
        assert_eq!(offer(&t, "s", 10.5, false), ThrottleDecision::Send);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecorded_update_does_not_throttle_the_next() {
        let t = throttle();
        assert_eq!(t.check("s", 10.0, false), ThrottleDecision::Send);
        assert_eq!(t.check("s", 10.5, false), ThrottleDecision::Send);
        t.record_sent("s", 10.5);
        assert_eq!(t.check("s", 11.0, false), ThrottleDecision::Collapse);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_never_throttled_and_seals_session() {
        let t = throttle();
        assert_eq!(offer(&t, "s", 99.0, false), ThrottleDecision::Send);
        assert_eq!(offer(&t, "s", 99.0, true), ThrottleDecision::Send);
        assert_eq!(offer(&t, "s", 99.0, true), ThrottleDecision::Send);
        assert_eq!(offer(&t, "s", 100.0, false), ThrottleDecision::AfterTerminal);
        t.record_sent("s", 100.0);
        assert_eq!(t.tracked_sessions(), 1);
        // Other sessions are unaffected.
        assert_eq!(offer(&t, "other", 1.0, false), ThrottleDecision::Send);
    }

    #[tokio::test(start_paused = true)]
    async fn unsealed_terminal_check_leaves_session_open() {
        let t = throttle();
        assert_eq!(t.check("s", 100.0, true), ThrottleDecision::Send);
        assert_eq!(t.check("s", 40.0, false), ThrottleDecision::Send);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_removes_stale_entries() {
        let t = throttle();
        offer(&t, "a", 1.0, false);
        offer(&t, "b", 1.0, true);
        tokio::time::advance(Duration::from_secs(120)).await;
        offer(&t, "c", 1.0, false);

        assert_eq!(t.prune(Duration::from_secs(60)), 2);
        assert_eq!(t.tracked_sessions(), 1);
    }
}
