//! Application Layer - Pipeline services and port definitions.
//!
//! This layer contains the services that move events from the bus to
//! clients and the port interfaces they depend on.

/// Port interfaces for the event bus and the client transport.
pub mod ports;

/// Broadcaster, event bridge and session progress tracker.
pub mod services;
