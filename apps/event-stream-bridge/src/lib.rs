#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Event Stream Bridge - Real-time Event Distribution
//!
//! Consumes trading-platform events from a topic bus and fans them out to
//! connected observers with per-client filtering, batching, rate limiting
//! and backpressure. Execution sessions are tracked beside the main flow
//! and their throttled progress is re-published through the same path.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pipeline types with no I/O
//!   - `streaming`: stream types, bus events, topic patterns, envelopes
//!   - `subscription`: subscription registry and per-client filters
//!   - `batch`: last-write-wins batch aggregation
//!   - `rate_limit`: token bucket
//!   - `session`: execution session state and progress throttling
//!   - `health`: component health reports
//!
//! - **Application**: Ports and services
//!   - `ports`: event bus and transport interfaces
//!   - `services`: `EventBridge`, `Broadcaster`, `SessionProgressTracker`
//!
//! - **Infrastructure**: Adapters and process concerns
//!   - `bus`: in-process event bus
//!   - `transport`: client hub
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                    ┌─────────────┐     ┌─────────────┐     ┌───────────┐
//! bus ──────────────►│ EventBridge │────►│ Broadcaster │────►│ ClientHub │──► clients
//!   │                └─────────────┘     └─────────────┘     └───────────┘
//!   │  execution.*   ┌─────────────────┐        ▲
//!   └───────────────►│ SessionTracker  │── broadcast.execution_* ──┘ (via bus)
//!                    └─────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Pipeline types with no I/O.
pub mod domain;

/// Application layer - Ports and services.
pub mod application;

/// Infrastructure layer - Adapters and process concerns.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{Envelope, Event, StreamType, TopicPattern};
pub use domain::subscription::{
    ClientId, RegistryConfig, SubscriptionError, SubscriptionFilter, SubscriptionRegistry,
};

// Ports
pub use application::ports::{EventBusPort, EventHandler, HandlerId, TransportPort, handler_fn};

// Services
pub use application::services::{
    Broadcaster, BroadcasterConfig, EventBridge, EventBridgeConfig, SessionProgressTracker,
    SessionTrackerConfig, StreamProcessor, default_processors,
};

// Adapters
pub use infrastructure::bus::InMemoryEventBus;
pub use infrastructure::transport::{ClientHub, HubConfig, HubError};

// Infrastructure config
pub use infrastructure::config::{BridgeConfig, ConfigError};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
