//! Client Hub
//!
//! In-process transport adapter. Holds one bounded outbound channel per
//! connected client, applies the subscription registry to every message
//! and handles the client command set.
//!
//! # Commands
//!
//! Commands arrive already validated as JSON objects of the form
//! `{type, action?, stream?, params?, id?}`. The command name is taken from
//! `action` when present and from `type` otherwise:
//!
//! - `subscribe`: create or replace a subscription, ack, then confirm
//! - `unsubscribe`: remove a subscription and ack
//! - `ping`: answer with `pong`
//!
//! Because the ack is queued on the client's channel before the
//! subscription is confirmed, it always precedes the first data message.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::application::ports::{TransportError, TransportPort};
use crate::domain::health::ComponentHealth;
use crate::domain::streaming::{Envelope, StreamType, UnknownStreamType};
use crate::domain::subscription::{
    ClientId, SubscriptionError, SubscriptionFilter, SubscriptionRegistry,
};
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Configuration
// =============================================================================

/// Client hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Concurrent client sends per broadcast.
    pub max_concurrent_broadcasts: usize,
    /// Outbound buffer per client.
    pub client_buffer: usize,
    /// Wait for room in a client's buffer before dropping.
    pub send_timeout: Duration,
    /// Subscription inactivity sweep interval.
    pub cleanup_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_concurrent_broadcasts: 50,
            client_buffer: 256,
            send_timeout: Duration::from_millis(50),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Client hub errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// A client with this id is already connected.
    #[error("client {0} is already connected")]
    AlreadyConnected(ClientId),

    /// No client with this id is connected.
    #[error("client {0} is not connected")]
    UnknownClient(ClientId),

    /// Client stopped reading its channel.
    #[error("client {0} is not reading")]
    ClientGone(ClientId),

    /// Command is missing a field or names an unknown action.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Command names an unknown stream.
    #[error(transparent)]
    UnknownStream(#[from] UnknownStreamType),

    /// Registry refused the subscription.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

// =============================================================================
// Client State
// =============================================================================

struct Client {
    tx: mpsc::Sender<Value>,
    connected_at: DateTime<Utc>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Per-client statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    /// Client id.
    pub client_id: ClientId,
    /// Connection time.
    pub connected_at: DateTime<Utc>,
    /// Streams subscribed to.
    pub subscriptions: Vec<StreamType>,
    /// Messages delivered.
    pub delivered: u64,
    /// Messages dropped because the client's buffer stayed full.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct HubCounters {
    connections: AtomicU64,
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    filtered: AtomicU64,
    slow_consumer_drops: AtomicU64,
    commands: AtomicU64,
    command_errors: AtomicU64,
}

/// Hub statistics.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    /// Currently connected clients.
    pub connected_clients: usize,
    /// Connections accepted since start.
    pub total_connections: u64,
    /// Envelopes fanned out.
    pub broadcasts: u64,
    /// Messages written to client channels.
    pub deliveries: u64,
    /// Per-client sends skipped by subscription filters.
    pub filtered: u64,
    /// Messages dropped on full client buffers.
    pub slow_consumer_drops: u64,
    /// Commands handled.
    pub commands: u64,
    /// Commands rejected.
    pub command_errors: u64,
    /// Per-client breakdown.
    pub clients: Vec<ClientStats>,
}

// =============================================================================
// Client Hub
// =============================================================================

/// Transport adapter fanning envelopes out to connected clients.
pub struct ClientHub {
    config: HubConfig,
    registry: Arc<SubscriptionRegistry>,
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    counters: HubCounters,
    running: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ClientHub {
    /// Create a hub over `registry`.
    #[must_use]
    pub fn new(config: HubConfig, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            config,
            registry,
            clients: RwLock::new(HashMap::new()),
            counters: HubCounters::default(),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// The registry the hub filters with.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Start the subscription inactivity sweep. Returns `false` if already
    /// started or stopped.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.cancel.is_cancelled() || self.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        let this = Arc::clone(self);
        self.tasks.spawn(async move { this.run_sweep().await });
        tracing::info!(
            max_concurrent = self.config.max_concurrent_broadcasts,
            client_buffer = self.config.client_buffer,
            "Client hub started"
        );
        true
    }

    /// Stop the sweep and close every client channel. Idempotent.
    pub async fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.tasks.close();
        if tokio::time::timeout(Duration::from_secs(1), self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!("Client hub sweep did not stop in time");
        }

        let ids: Vec<ClientId> = self.clients.read().keys().cloned().collect();
        for id in &ids {
            self.disconnect(id);
        }
        self.running.store(false, Ordering::Release);
        tracing::info!(closed = ids.len(), "Client hub stopped");
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    /// Register a client and return the receiving end of its channel.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::AlreadyConnected`] for a duplicate id.
    pub fn connect(&self, client_id: &str) -> Result<mpsc::Receiver<Value>, HubError> {
        let (tx, rx) = mpsc::channel(self.config.client_buffer.max(1));
        let mut clients = self.clients.write();
        if clients.contains_key(client_id) {
            return Err(HubError::AlreadyConnected(client_id.to_string()));
        }
        clients.insert(
            client_id.to_string(),
            Arc::new(Client {
                tx,
                connected_at: Utc::now(),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        );
        let connected = clients.len();
        drop(clients);

        self.counters.connections.fetch_add(1, Ordering::Relaxed);
        metrics::set_connected_clients(connected);
        tracing::info!(client_id, connected, "Client connected");
        Ok(rx)
    }

    /// Remove a client and all of its subscriptions.
    pub fn disconnect(&self, client_id: &str) -> bool {
        let removed = self.clients.write().remove(client_id).is_some();
        if !removed {
            return false;
        }

        let streams = self.registry.client_disconnected(client_id);
        for stream in &streams {
            metrics::set_subscriptions(*stream, self.registry.subscribers(*stream).len());
        }
        let connected = self.client_count();
        metrics::set_connected_clients(connected);
        tracing::info!(
            client_id,
            dropped_subscriptions = streams.len(),
            connected,
            "Client disconnected"
        );
        true
    }

    /// Whether a client is connected.
    #[must_use]
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.clients.read().contains_key(client_id)
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    fn client(&self, client_id: &str) -> Option<Arc<Client>> {
        self.clients.read().get(client_id).map(Arc::clone)
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Handle one inbound command. Failures are also reported to the client
    /// as an `error` message carrying the command's `id`.
    ///
    /// # Errors
    ///
    /// Returns the reason the command was rejected.
    pub async fn handle_command(&self, client_id: &str, command: &Value) -> Result<(), HubError> {
        let client = self
            .client(client_id)
            .ok_or_else(|| HubError::UnknownClient(client_id.to_string()))?;
        self.counters.commands.fetch_add(1, Ordering::Relaxed);
        self.registry.touch(client_id);

        let request_id = command.get("id").cloned().unwrap_or(Value::Null);
        let result = self.run_command(client_id, &client, command, &request_id).await;

        if let Err(err) = &result {
            self.counters.command_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(client_id, error = %err, "Client command rejected");
            if !matches!(err, HubError::ClientGone(_)) {
                let reply = json!({
                    "type": "error",
                    "id": request_id,
                    "message": err.to_string(),
                    "timestamp": Utc::now().to_rfc3339(),
                });
                if self.reply(client_id, &client, reply).await.is_err() {
                    tracing::debug!(client_id, "Error reply not delivered");
                }
            }
        }
        result
    }

    async fn run_command(
        &self,
        client_id: &str,
        client: &Client,
        command: &Value,
        request_id: &Value,
    ) -> Result<(), HubError> {
        let action = command
            .get("action")
            .or_else(|| command.get("type"))
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidCommand("missing type".to_string()))?;

        match action {
            "ping" => {
                let pong = json!({
                    "type": "pong",
                    "id": request_id,
                    "timestamp": Utc::now().to_rfc3339(),
                });
                self.reply(client_id, client, pong).await
            }
            "subscribe" => {
                let stream = command_stream(command)?;
                let params = command.get("params").unwrap_or(&Value::Null);
                let filter = SubscriptionFilter::from_params(params)
                    .map_err(|e| HubError::InvalidCommand(format!("invalid filter: {e}")))?;
                let created = self.registry.subscribe_client(client_id, stream, filter)?;

                let ack = ack(stream, "subscribe", "subscribed", request_id);
                if let Err(err) = self.reply(client_id, client, ack).await {
                    self.registry.unsubscribe_client(client_id, stream);
                    return Err(err);
                }
                self.registry.confirm_subscription(client_id, stream);
                metrics::set_subscriptions(stream, self.registry.subscribers(stream).len());
                tracing::debug!(client_id, stream = %stream, created, "Subscription confirmed");
                Ok(())
            }
            "unsubscribe" => {
                let stream = command_stream(command)?;
                let removed = self.registry.unsubscribe_client(client_id, stream);
                metrics::set_subscriptions(stream, self.registry.subscribers(stream).len());
                let status = if removed { "unsubscribed" } else { "not_subscribed" };
                self.reply(client_id, client, ack(stream, "unsubscribe", status, request_id))
                    .await
            }
            other => Err(HubError::InvalidCommand(format!("unknown command '{other}'"))),
        }
    }

    async fn reply(&self, client_id: &str, client: &Client, message: Value) -> Result<(), HubError> {
        client
            .tx
            .send_timeout(message, self.config.send_timeout)
            .await
            .map_err(|_| HubError::ClientGone(client_id.to_string()))
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    /// The message a client should get for `envelope`, if any. Batches are
    /// filtered item by item.
    fn personalize(
        &self,
        client_id: &str,
        stream: StreamType,
        envelope: &Envelope,
        encoded: &Value,
    ) -> Option<Value> {
        if !envelope.is_batch() {
            return self
                .registry
                .should_send_to_client(client_id, stream, &envelope.data)
                .then(|| encoded.clone());
        }

        let Value::Array(items) = &envelope.data else {
            return None;
        };
        let kept: Vec<Value> = items
            .iter()
            .filter(|item| self.registry.should_send_to_client(client_id, stream, item))
            .cloned()
            .collect();
        if kept.is_empty() {
            return None;
        }
        if kept.len() == items.len() {
            return Some(encoded.clone());
        }

        let mut message = encoded.clone();
        if let Value::Object(fields) = &mut message {
            fields.insert("batch_size".to_string(), json!(kept.len()));
            fields.insert("data".to_string(), Value::Array(kept));
        }
        Some(message)
    }

    async fn run_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let marked = self.registry.sweep_inactive();
                    if marked > 0 {
                        tracing::info!(marked, "Inactive subscriptions flagged");
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Hub statistics.
    #[must_use]
    pub fn get_stats(&self) -> HubStats {
        let clients: Vec<(ClientId, Arc<Client>)> = self
            .clients
            .read()
            .iter()
            .map(|(id, c)| (id.clone(), Arc::clone(c)))
            .collect();

        let mut per_client: Vec<ClientStats> = clients
            .into_iter()
            .map(|(client_id, client)| ClientStats {
                subscriptions: self.registry.client_subscriptions(&client_id),
                client_id,
                connected_at: client.connected_at,
                delivered: client.delivered.load(Ordering::Relaxed),
                dropped: client.dropped.load(Ordering::Relaxed),
            })
            .collect();
        per_client.sort_by(|a, b| a.client_id.cmp(&b.client_id));

        let c = &self.counters;
        HubStats {
            connected_clients: per_client.len(),
            total_connections: c.connections.load(Ordering::Relaxed),
            broadcasts: c.broadcasts.load(Ordering::Relaxed),
            deliveries: c.deliveries.load(Ordering::Relaxed),
            filtered: c.filtered.load(Ordering::Relaxed),
            slow_consumer_drops: c.slow_consumer_drops.load(Ordering::Relaxed),
            commands: c.commands.load(Ordering::Relaxed),
            command_errors: c.command_errors.load(Ordering::Relaxed),
            clients: per_client,
        }
    }

    /// Hub health. Degraded when more than a tenth of delivery attempts are
    /// dropped on slow consumers.
    #[must_use]
    pub fn health_check(&self) -> ComponentHealth {
        let mut health = ComponentHealth::healthy("client_hub");
        if self.cancel.is_cancelled() {
            health.fail("client hub stopped");
            return health;
        }

        let drops = self.counters.slow_consumer_drops.load(Ordering::Relaxed);
        let attempts = drops + self.counters.deliveries.load(Ordering::Relaxed);
        if attempts > 0 && drops * 10 > attempts {
            health.degrade(format!("{drops} of {attempts} client sends dropped"));
        }
        health
    }
}

impl std::fmt::Debug for ClientHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHub")
            .field("config", &self.config)
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TransportPort for ClientHub {
    async fn broadcast_to_subscribers(
        &self,
        stream: StreamType,
        envelope: Arc<Envelope>,
        exclude_client: Option<ClientId>,
    ) -> Result<usize, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let subscribers = self.registry.subscribers(stream);
        let recipients: Vec<(ClientId, Arc<Client>)> = {
            let clients = self.clients.read();
            subscribers
                .into_iter()
                .filter(|id| exclude_client.as_deref() != Some(id.as_str()))
                .filter_map(|id| clients.get(&id).map(|c| (id, Arc::clone(c))))
                .collect()
        };
        if recipients.is_empty() {
            return Ok(0);
        }

        let encoded = serde_json::to_value(envelope.as_ref()).map_err(|e| {
            TransportError::Serialization {
                message: e.to_string(),
            }
        })?;
        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);

        let delivered = AtomicUsize::new(0);
        let gone = Mutex::new(Vec::new());
        {
            let (delivered, gone, encoded, envelope) = (&delivered, &gone, &encoded, &envelope);
            let limit = self.config.max_concurrent_broadcasts;
            futures_util::stream::iter(recipients)
                .for_each_concurrent(limit, move |(client_id, client)| async move {
                    let Some(message) = self.personalize(&client_id, stream, envelope, encoded)
                    else {
                        self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                        return;
                    };

                    match client.tx.send_timeout(message, self.config.send_timeout).await {
                        Ok(()) => {
                            client.delivered.fetch_add(1, Ordering::Relaxed);
                            self.registry.record_delivery(&client_id, stream);
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(SendTimeoutError::Timeout(_)) => {
                            client.dropped.fetch_add(1, Ordering::Relaxed);
                            self.counters
                                .slow_consumer_drops
                                .fetch_add(1, Ordering::Relaxed);
                            metrics::record_message_dropped(stream, DropReason::SlowConsumer);
                            tracing::warn!(
                                client_id = %client_id,
                                stream = %stream,
                                "Client buffer full, message dropped"
                            );
                        }
                        Err(SendTimeoutError::Closed(_)) => gone.lock().push(client_id),
                    }
                })
                .await;
        }

        for client_id in gone.into_inner() {
            self.disconnect(&client_id);
        }

        let delivered = delivered.into_inner();
        self.counters
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }
}

fn command_stream(command: &Value) -> Result<StreamType, HubError> {
    let name = command
        .get("stream")
        .and_then(Value::as_str)
        .ok_or_else(|| HubError::InvalidCommand("missing stream".to_string()))?;
    Ok(name.parse()?)
}

fn ack(stream: StreamType, action: &str, status: &str, request_id: &Value) -> Value {
    json!({
        "type": "subscription_ack",
        "action": action,
        "stream": stream.as_str(),
        "status": status,
        "id": request_id,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

// =============================================================================
// Tests
// =============================================================================
