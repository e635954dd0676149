//! Event Stream Bridge Binary
//!
//! Starts the event distribution pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin event-stream-bridge
//! ```
//!
//! # Environment Variables
//!
//! - `STREAM_BRIDGE_HEALTH_PORT`: Health, stats and metrics HTTP port (default: 8083)
//! - `STREAM_BRIDGE_MAX_QUEUE_SIZE`: Broadcast queue bound (default: 10000)
//! - `STREAM_BRIDGE_MAX_BATCH_SIZE`: Keys per batch (default: 50)
//! - `STREAM_BRIDGE_BATCH_FLUSH_INTERVAL_MS`: Batch age flush (default: 100)
//! - `STREAM_BRIDGE_SESSION_TTL_HOURS`: Idle session eviction (default: 24)
//! - `STREAM_BRIDGE_CLEANUP_INTERVAL_SECONDS`: Maintenance sweeps (default: 60)
//! - `OTEL_ENABLED`: Enable OTLP span export (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: event-stream-bridge)
//! - `RUST_LOG`: Log level (default: info)
//!
//! See `BridgeConfig::from_env` for the full list.

use std::sync::Arc;

use anyhow::Context;
use event_stream_bridge::application::ports::{EventBusPort, TransportPort};
use event_stream_bridge::infrastructure::health::{HealthServer, HealthServerState};
use event_stream_bridge::infrastructure::telemetry;
use event_stream_bridge::{
    BridgeConfig, Broadcaster, ClientHub, EventBridge, InMemoryEventBus, SessionProgressTracker,
    SubscriptionRegistry, default_processors, init_metrics,
};
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting event stream bridge");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = BridgeConfig::from_env().context("invalid bridge configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Adapters
    let bus = Arc::new(InMemoryEventBus::new());
    let bus_port: Arc<dyn EventBusPort> = Arc::clone(&bus) as Arc<dyn EventBusPort>;
    let registry = Arc::new(SubscriptionRegistry::new(config.registry()));
    let hub = Arc::new(ClientHub::new(config.hub(), registry));
    let transport: Arc<dyn TransportPort> = Arc::clone(&hub) as Arc<dyn TransportPort>;

    // Pipeline
    let broadcaster = Arc::new(
        Broadcaster::new(config.broadcaster(), transport).context("failed to build broadcaster")?,
    );
    let bridge = Arc::new(
        EventBridge::new(
            config.bridge(),
            default_processors(config.batch_policy()),
            Arc::clone(&bus_port),
            Arc::clone(&broadcaster),
        )
        .context("failed to build event bridge")?,
    );
    let tracker = Arc::new(SessionProgressTracker::new(
        config.session_tracker(),
        bus_port,
    ));

    // Consumers before producers
    hub.start();
    broadcaster.start();
    tracker.start();
    bridge.start();

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&bridge),
        Arc::clone(&broadcaster),
        Arc::clone(&tracker),
        Arc::clone(&hub),
        Arc::clone(&bus),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    bus.publish(
        "system.bridge",
        json!({"status": "started", "version": env!("CARGO_PKG_VERSION")}),
    )
    .await;

    tracing::info!("Event stream bridge ready");

    await_shutdown(shutdown_token).await;

    // Producers before consumers
    bridge.stop().await;
    tracker.stop().await;
    broadcaster.stop().await;
    hub.stop().await;

    if let Err(e) = health_task.await {
        tracing::warn!(error = %e, "Health server task ended abnormally");
    }

    tracing::info!("Event stream bridge stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                if let Err(e) = dotenvy::from_path(&env_path) {
                    eprintln!("Failed to load {}: {e}", env_path.display());
                }
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &BridgeConfig) {
    tracing::info!(
        health_port = config.server.health_port,
        max_queue_size = config.broadcast.max_queue_size,
        max_batch_size = config.batch.max_batch_size,
        batch_flush_ms = config.batch.batch_flush_interval.as_millis(),
        dispatch_concurrency = config.dispatch.immediate_dispatch_concurrency,
        fanout_concurrency = config.dispatch.max_concurrent_broadcasts,
        session_ttl_secs = config.session.session_ttl.as_secs(),
        "Configuration loaded"
    );
    tracing::debug!(
        token_bucket_max_tokens = config.broadcast.token_bucket_max_tokens,
        token_bucket_refill_rate = config.broadcast.token_bucket_refill_rate,
        latency_threshold_ms = config.broadcast.latency_threshold.as_millis(),
        progress_throttle_ms = config.broadcast.progress_throttle_interval.as_millis(),
        max_message_size_bytes = config.batch.max_message_size_bytes,
        cleanup_interval_secs = config.cleanup_interval.as_secs(),
        "Pipeline limits"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
    tracing::info!("Graceful shutdown started");
}
