//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the process
//! concerns around them (configuration, health, metrics, tracing).

/// In-process event bus.
pub mod bus;

/// Client hub transport adapter.
pub mod transport;

/// Environment configuration.
pub mod config;

/// Health, stats and metrics HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Log and trace subscriber setup.
pub mod telemetry;
