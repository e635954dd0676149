//! Domain Layer - Core pipeline types and business rules.
//!
//! Everything here is synchronous and transport-agnostic. Async code only
//! appears where a type must wait on time (token bucket, batch readiness).

/// Stream types, bus events, topic patterns and the outbound envelope.
pub mod streaming;

/// Client subscriptions, filters and the subscription registry.
pub mod subscription;

/// Keyed batch aggregation.
pub mod batch;

/// Token bucket rate limiting.
pub mod rate_limit;

/// Execution session progress, results and throttling.
pub mod session;

/// Component health reports.
pub mod health;
