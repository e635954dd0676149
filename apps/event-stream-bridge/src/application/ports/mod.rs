//! Port Interfaces
//!
//! Contracts between the pipeline services and the outside world,
//! following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `TransportPort`: delivers an envelope to every interested client
//!
//! ## Driver Ports (Inbound)
//!
//! - `EventBusPort`: topic pub/sub feeding events into the pipeline

mod event_bus_port;
mod transport_port;

pub use event_bus_port::{EventBusPort, EventHandler, HandlerId, handler_fn};
pub use transport_port::{NoOpTransport, TransportError, TransportPort};
