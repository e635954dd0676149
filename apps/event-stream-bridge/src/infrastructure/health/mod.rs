//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, pipeline statistics and Prometheus
//! metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Aggregate JSON health of every component
//! - `GET /stats` - Every component's statistics
//! - `GET /sessions` - Live execution sessions and recent results
//! - `GET /healthz` - Liveness check (simple OK)
//! - `GET /readyz` - Readiness check (every component serving)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{
    BridgeStats, Broadcaster, BroadcasterStats, EventBridge, SessionProgressTracker, TrackerStats,
};
use crate::domain::health::{ComponentHealth, HealthStatus, overall_status};
use crate::domain::session::ExecutionResult;
use crate::domain::subscription::RegistryStats;
use crate::infrastructure::bus::{BusStats, InMemoryEventBus};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::transport::{ClientHub, HubStats};

const RECENT_RESULTS: usize = 20;

// =============================================================================
// Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Worst status across components.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Per-component reports.
    pub components: Vec<ComponentHealth>,
}

/// Statistics response.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Event bridge.
    pub bridge: BridgeStats,
    /// Broadcaster.
    pub broadcaster: BroadcasterStats,
    /// Session tracker.
    pub session_tracker: TrackerStats,
    /// Subscription registry.
    pub subscriptions: RegistryStats,
    /// Client hub.
    pub clients: HubStats,
    /// Event bus.
    pub bus: BusStats,
}

/// Session listing response.
#[derive(Debug, Clone, Serialize)]
pub struct SessionsResponse {
    /// Live session ids.
    pub active: Vec<String>,
    /// Most recent terminal results, newest first.
    pub recent: Vec<ExecutionResult>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Pipeline components reported on by the health server.
#[derive(Clone)]
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    bridge: Arc<EventBridge>,
    broadcaster: Arc<Broadcaster>,
    tracker: Arc<SessionProgressTracker>,
    hub: Arc<ClientHub>,
    bus: Arc<InMemoryEventBus>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        bridge: Arc<EventBridge>,
        broadcaster: Arc<Broadcaster>,
        tracker: Arc<SessionProgressTracker>,
        hub: Arc<ClientHub>,
        bus: Arc<InMemoryEventBus>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            bridge,
            broadcaster,
            tracker,
            hub,
            bus,
        }
    }

    fn components(&self) -> Vec<ComponentHealth> {
        vec![
            self.bridge.health_check(),
            self.broadcaster.health_check(),
            self.tracker.health_check(),
            self.hub.registry().health_check(),
            self.hub.health_check(),
        ]
    }

    /// Aggregate health.
    #[must_use]
    pub fn health(&self) -> HealthResponse {
        let components = self.components();
        HealthResponse {
            status: overall_status(&components),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            components,
        }
    }

    /// Every component's statistics.
    #[must_use]
    pub fn stats(&self) -> StatsResponse {
        StatsResponse {
            bridge: self.bridge.get_stats(),
            broadcaster: self.broadcaster.get_stats(),
            session_tracker: self.tracker.get_stats(),
            subscriptions: self.hub.registry().stats(),
            clients: self.hub.get_stats(),
            bus: self.bus.stats(),
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by the health server.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/sessions", get(sessions_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = state.health();
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn stats_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn sessions_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    Json(SessionsResponse {
        active: state.tracker.active_sessions(),
        recent: state.tracker.recent_results(RECENT_RESULTS),
    })
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.components().iter().all(ComponentHealth::is_serving) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{EventBusPort, TransportPort};
    use crate::application::services::{
        BroadcasterConfig, EventBridgeConfig, SessionTrackerConfig, default_processors,
    };
    use crate::domain::batch::BatchPolicy;
    use crate::domain::subscription::SubscriptionRegistry;
    use crate::infrastructure::transport::HubConfig;

    fn state() -> Arc<HealthServerState> {
        let bus = Arc::new(InMemoryEventBus::new());
        let hub = Arc::new(ClientHub::new(
            HubConfig::default(),
            Arc::new(SubscriptionRegistry::default()),
        ));
        let transport: Arc<dyn TransportPort> = Arc::clone(&hub) as Arc<dyn TransportPort>;
        let broadcaster =
            Arc::new(Broadcaster::new(BroadcasterConfig::default(), transport).unwrap());
        let bus_port: Arc<dyn EventBusPort> = Arc::clone(&bus) as Arc<dyn EventBusPort>;
        let bridge = Arc::new(
            EventBridge::new(
                EventBridgeConfig::default(),
                default_processors(BatchPolicy::default()),
                Arc::clone(&bus_port),
                Arc::clone(&broadcaster),
            )
            .unwrap(),
        );
        let tracker = Arc::new(SessionProgressTracker::new(
            SessionTrackerConfig::default(),
            bus_port,
        ));
        Arc::new(HealthServerState::new(
            "test".to_string(),
            bridge,
            broadcaster,
            tracker,
            hub,
            bus,
        ))
    }

    async fn get(state: &Arc<HealthServerState>, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router(Arc::clone(state))
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn stopped_components_are_unhealthy() {
        let state = state();

        let (status, body) = get(&state, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["version"], "test");
        assert_eq!(json["components"].as_array().unwrap().len(), 5);

        let (status, _) = get(&state, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn started_pipeline_is_ready() {
        let state = state();
        assert!(state.broadcaster.start());
        assert!(state.bridge.start());
        assert!(state.tracker.start());
        assert!(state.hub.start());

        let (status, body) = get(&state, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"READY");

        let (status, body) = get(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");

        state.bridge.stop().await;
        state.tracker.stop().await;
        state.broadcaster.stop().await;
        state.hub.stop().await;
    }

    #[tokio::test]
    async fn stats_and_sessions_render() {
        let state = state();

        let (status, body) = get(&state, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        for key in ["bridge", "broadcaster", "session_tracker", "subscriptions", "clients", "bus"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }

        let (status, body) = get(&state, "/sessions").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["active"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn liveness_is_unconditional() {
        let (status, body) = get(&state(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }
}
