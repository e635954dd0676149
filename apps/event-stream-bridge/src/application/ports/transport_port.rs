//! Transport Port (Driven Port)
//!
//! Opaque "send to subscribed clients" capability. The pipeline has no
//! knowledge of sockets, framing or heartbeats.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::streaming::{Envelope, StreamType};
use crate::domain::subscription::ClientId;

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Envelope could not be serialized.
    #[error("envelope serialization failed: {message}")]
    Serialization {
        /// Underlying error.
        message: String,
    },

    /// Transport is shutting down or closed.
    #[error("transport closed")]
    Closed,

    /// Delivery failed.
    #[error("delivery failed: {message}")]
    DeliveryFailed {
        /// Failure description.
        message: String,
    },
}

/// Port for delivering envelopes to clients.
#[async_trait]
pub trait TransportPort: Send + Sync {
    /// Deliver `envelope` to every client subscribed to `stream` whose
    /// filter accepts it, skipping `exclude_client`.
    ///
    /// Returns the number of clients the envelope was delivered to.
    async fn broadcast_to_subscribers(
        &self,
        stream: StreamType,
        envelope: Arc<Envelope>,
        exclude_client: Option<ClientId>,
    ) -> Result<usize, TransportError>;
}

/// Transport that delivers nowhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTransport;

#[async_trait]
impl TransportPort for NoOpTransport {
    async fn broadcast_to_subscribers(
        &self,
        _stream: StreamType,
        _envelope: Arc<Envelope>,
        _exclude_client: Option<ClientId>,
    ) -> Result<usize, TransportError> {
        Ok(0)
    }
}
