//! Application Services
//!
//! Services that move events from the bus to clients.
//!
//! - `Broadcaster`: validated, rate-limited, bounded-queue delivery
//! - `EventBridge`: routes bus events to streams, batching where configured
//! - `SessionProgressTracker`: per-session progress state machine
//! - `retry`: exponential backoff shared by the services

/// Rate-limited, backpressure-aware broadcaster.
pub mod broadcaster;

/// Bus-to-broadcaster routing with batching.
pub mod bridge;

/// Exponential backoff with jitter.
pub mod retry;

/// Execution session progress tracking.
pub mod session_tracker;

pub use broadcaster::{
    BroadcastError, Broadcaster, BroadcasterConfig, BroadcasterStats, validate_payload,
};
pub use bridge::{
    BridgeError, BridgeStats, EventBridge, EventBridgeConfig, StreamProcessor, default_processors,
};
pub use session_tracker::{SessionProgressTracker, SessionTrackerConfig, TrackerStats};
