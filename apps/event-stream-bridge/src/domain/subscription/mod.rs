//! Subscription Registry
//!
//! Tracks which clients are subscribed to which streams and decides, per
//! message, whether a client should receive it.
//!
//! # Design
//!
//! The registry keeps:
//! - One [`ClientSubscription`] per `(client_id, stream)` pair
//! - A reverse index `stream -> clients` for fan-out enumeration
//! - A per-client index used for the subscription cap and disconnect cleanup
//!
//! # Confirmation Protocol
//!
//! `subscribe_client` creates the entry with `awaiting_confirmation = true`.
//! The caller sends the subscribe acknowledgement and only then calls
//! `confirm_subscription`, so the ack always precedes the first data message
//! for that subscription.

mod filter;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

pub use filter::SubscriptionFilter;

use crate::domain::health::ComponentHealth;
use crate::domain::streaming::StreamType;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a connected client.
pub type ClientId = String;

/// Registry limits.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of streams a single client may subscribe to.
    pub max_subscriptions_per_client: usize,
    /// Idle time after which a subscription is marked inactive.
    pub inactivity_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_client: 20,
            inactivity_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Subscription request errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// Client already holds the maximum number of subscriptions.
    #[error("client {client_id} reached the subscription limit ({limit})")]
    LimitExceeded {
        /// Offending client.
        client_id: ClientId,
        /// Configured cap.
        limit: usize,
    },
}

/// A single client's subscription to one stream.
#[derive(Debug)]
struct ClientSubscription {
    filter: SubscriptionFilter,
    awaiting_confirmation: bool,
    is_active: bool,
    created_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    last_activity: Instant,
    messages_sent: AtomicU64,
    messages_filtered: AtomicU64,
}

impl ClientSubscription {
    fn new(filter: SubscriptionFilter) -> Self {
        Self {
            filter,
            awaiting_confirmation: true,
            is_active: true,
            created_at: Utc::now(),
            confirmed_at: None,
            last_activity: Instant::now(),
            messages_sent: AtomicU64::new(0),
            messages_filtered: AtomicU64::new(0),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.is_active = true;
    }
}

/// Read-only view of a subscription.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSnapshot {
    /// Subscribed client.
    pub client_id: ClientId,
    /// Subscribed stream.
    pub subscription_type: StreamType,
    /// Active filter.
    pub filter: SubscriptionFilter,
    /// Still waiting for the ack to be sent.
    pub awaiting_confirmation: bool,
    /// False once the inactivity sweep has flagged it.
    pub is_active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Confirmation time.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Seconds since the last client activity.
    pub idle_secs: u64,
    /// Messages delivered.
    pub messages_sent: u64,
    /// Messages rejected by the filter.
    pub messages_filtered: u64,
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    subscriptions: HashMap<(ClientId, StreamType), ClientSubscription>,
    by_stream: HashMap<StreamType, HashSet<ClientId>>,
    by_client: HashMap<ClientId, HashSet<StreamType>>,
}

impl RegistryState {
    fn insert(&mut self, client_id: &str, stream: StreamType, sub: ClientSubscription) {
        self.subscriptions
            .insert((client_id.to_string(), stream), sub);
        self.by_stream
            .entry(stream)
            .or_default()
            .insert(client_id.to_string());
        self.by_client
            .entry(client_id.to_string())
            .or_default()
            .insert(stream);
    }

    fn remove(&mut self, client_id: &str, stream: StreamType) -> bool {
        let removed = self
            .subscriptions
            .remove(&(client_id.to_string(), stream))
            .is_some();
        if !removed {
            return false;
        }

        if let Some(clients) = self.by_stream.get_mut(&stream) {
            clients.remove(client_id);
            if clients.is_empty() {
                self.by_stream.remove(&stream);
            }
        }
        if let Some(streams) = self.by_client.get_mut(client_id) {
            streams.remove(&stream);
            if streams.is_empty() {
                self.by_client.remove(client_id);
            }
        }
        true
    }

    fn get(&self, client_id: &str, stream: StreamType) -> Option<&ClientSubscription> {
        self.subscriptions.get(&(client_id.to_string(), stream))
    }

    fn get_mut(&mut self, client_id: &str, stream: StreamType) -> Option<&mut ClientSubscription> {
        self.subscriptions.get_mut(&(client_id.to_string(), stream))
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe registry of client subscriptions.
///
/// # Example
///
/// ```rust
/// use event_stream_bridge::domain::streaming::StreamType;
/// use event_stream_bridge::domain::subscription::{SubscriptionFilter, SubscriptionRegistry};
/// use serde_json::json;
///
/// let registry = SubscriptionRegistry::default();
/// let filter = SubscriptionFilter::default().with_symbols(["BTC_USDT"]);
/// registry.subscribe_client("c1", StreamType::MarketData, filter).unwrap();
///
/// // Nothing is delivered until the ack has gone out and the caller confirms.
/// let btc = json!({"symbol": "BTC_USDT"});
/// assert!(!registry.should_send_to_client("c1", StreamType::MarketData, &btc));
///
/// registry.confirm_subscription("c1", StreamType::MarketData);
/// assert!(registry.should_send_to_client("c1", StreamType::MarketData, &btc));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    config: RegistryConfig,
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create a registry with the given limits.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Create or replace a subscription. The entry starts out awaiting
    /// confirmation.
    ///
    /// Returns `true` when a new subscription was created and `false` when
    /// an existing one had its filter replaced.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::LimitExceeded`] when the client already
    /// holds the maximum number of subscriptions.
    pub fn subscribe_client(
        &self,
        client_id: &str,
        stream: StreamType,
        filter: SubscriptionFilter,
    ) -> Result<bool, SubscriptionError> {
        let filter = filter.normalized();
        let mut state = self.state.write();

        if let Some(existing) = state.get_mut(client_id, stream) {
            existing.filter = filter;
            existing.awaiting_confirmation = true;
            existing.confirmed_at = None;
            existing.touch();
            return Ok(false);
        }

        let held = state.by_client.get(client_id).map_or(0, HashSet::len);
        if held >= self.config.max_subscriptions_per_client {
            return Err(SubscriptionError::LimitExceeded {
                client_id: client_id.to_string(),
                limit: self.config.max_subscriptions_per_client,
            });
        }

        state.insert(client_id, stream, ClientSubscription::new(filter));
        tracing::debug!(client_id, stream = %stream, "Subscription created");
        Ok(true)
    }

    /// Mark a subscription as confirmed. Idempotent.
    ///
    /// Returns `false` if the subscription does not exist.
    pub fn confirm_subscription(&self, client_id: &str, stream: StreamType) -> bool {
        let mut state = self.state.write();
        let Some(sub) = state.get_mut(client_id, stream) else {
            return false;
        };

        if sub.awaiting_confirmation {
            sub.awaiting_confirmation = false;
            sub.confirmed_at = Some(Utc::now());
        }
        sub.touch();
        true
    }

    /// Remove a subscription.
    pub fn unsubscribe_client(&self, client_id: &str, stream: StreamType) -> bool {
        let removed = self.state.write().remove(client_id, stream);
        if removed {
            tracing::debug!(client_id, stream = %stream, "Subscription removed");
        }
        removed
    }

    /// Remove every subscription held by a client.
    ///
    /// Returns the streams the client was subscribed to.
    pub fn client_disconnected(&self, client_id: &str) -> Vec<StreamType> {
        let mut state = self.state.write();
        let streams: Vec<StreamType> = state
            .by_client
            .get(client_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        for stream in &streams {
            state.remove(client_id, *stream);
        }
        streams
    }

    /// Record client activity on every subscription it holds.
    pub fn touch(&self, client_id: &str) {
        let mut state = self.state.write();
        let streams: Vec<StreamType> = state
            .by_client
            .get(client_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        for stream in streams {
            if let Some(sub) = state.get_mut(client_id, stream) {
                sub.touch();
            }
        }
    }

    /// Clients subscribed to a stream.
    #[must_use]
    pub fn subscribers(&self, stream: StreamType) -> Vec<ClientId> {
        self.state
            .read()
            .by_stream
            .get(&stream)
            .map(|clients| clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Decide whether `data` on `stream` should be delivered to a client.
    ///
    /// Always `false` for unknown, inactive, or unconfirmed subscriptions.
    #[must_use]
    pub fn should_send_to_client(&self, client_id: &str, stream: StreamType, data: &Value) -> bool {
        let state = self.state.read();
        let Some(sub) = state.get(client_id, stream) else {
            return false;
        };

        if !sub.is_active || sub.awaiting_confirmation {
            return false;
        }

        let matched = sub.filter.matches(stream, data);
        if !matched {
            sub.messages_filtered.fetch_add(1, Ordering::Relaxed);
        }
        matched
    }

    /// Count a successful delivery.
    pub fn record_delivery(&self, client_id: &str, stream: StreamType) {
        if let Some(sub) = self.state.read().get(client_id, stream) {
            sub.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The filter attached to a subscription.
    #[must_use]
    pub fn filters(&self, client_id: &str, stream: StreamType) -> Option<SubscriptionFilter> {
        self.state
            .read()
            .get(client_id, stream)
            .map(|sub| sub.filter.clone())
    }

    /// Snapshot of a single subscription.
    #[must_use]
    pub fn subscription(&self, client_id: &str, stream: StreamType) -> Option<SubscriptionSnapshot> {
        let state = self.state.read();
        let sub = state.get(client_id, stream)?;
        Some(SubscriptionSnapshot {
            client_id: client_id.to_string(),
            subscription_type: stream,
            filter: sub.filter.clone(),
            awaiting_confirmation: sub.awaiting_confirmation,
            is_active: sub.is_active,
            created_at: sub.created_at,
            confirmed_at: sub.confirmed_at,
            idle_secs: sub.last_activity.elapsed().as_secs(),
            messages_sent: sub.messages_sent.load(Ordering::Relaxed),
            messages_filtered: sub.messages_filtered.load(Ordering::Relaxed),
        })
    }

    /// Streams a client is subscribed to.
    #[must_use]
    pub fn client_subscriptions(&self, client_id: &str) -> Vec<StreamType> {
        let mut streams: Vec<StreamType> = self
            .state
            .read()
            .by_client
            .get(client_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        streams.sort();
        streams
    }

    /// Mark subscriptions idle for longer than the inactivity timeout as
    /// inactive. Nothing is removed.
    ///
    /// Returns the number of subscriptions newly marked inactive.
    pub fn sweep_inactive(&self) -> usize {
        let timeout = self.config.inactivity_timeout;
        let mut state = self.state.write();
        let mut marked = 0;

        for ((client_id, stream), sub) in &mut state.subscriptions {
            if sub.is_active && sub.last_activity.elapsed() >= timeout {
                sub.is_active = false;
                marked += 1;
                tracing::info!(client_id = %client_id, stream = %stream, "Subscription marked inactive");
            }
        }
        marked
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        let mut per_stream = HashMap::new();
        for (stream, clients) in &state.by_stream {
            per_stream.insert(stream.as_str(), clients.len());
        }

        let mut awaiting = 0;
        let mut inactive = 0;
        let mut messages_sent = 0;
        let mut messages_filtered = 0;
        for sub in state.subscriptions.values() {
            awaiting += usize::from(sub.awaiting_confirmation);
            inactive += usize::from(!sub.is_active);
            messages_sent += sub.messages_sent.load(Ordering::Relaxed);
            messages_filtered += sub.messages_filtered.load(Ordering::Relaxed);
        }

        let cap = self.config.max_subscriptions_per_client;
        let clients_at_cap = state
            .by_client
            .values()
            .filter(|streams| streams.len() >= cap)
            .count();

        RegistryStats {
            total_subscriptions: state.subscriptions.len(),
            client_count: state.by_client.len(),
            clients_at_cap,
            awaiting_confirmation: awaiting,
            inactive,
            per_stream,
            messages_sent,
            messages_filtered,
        }
    }

    /// Registry health.
    #[must_use]
    pub fn health_check(&self) -> ComponentHealth {
        let stats = self.stats();
        let mut health = ComponentHealth::healthy("subscription_registry");
        if stats.client_count > 0 && stats.clients_at_cap * 2 > stats.client_count {
            health.degrade(format!(
                "{} of {} clients at the subscription limit",
                stats.clients_at_cap, stats.client_count
            ));
        }
        health
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    /// Number of `(client, stream)` subscriptions.
    pub total_subscriptions: usize,
    /// Number of distinct clients with at least one subscription.
    pub client_count: usize,
    /// Clients holding the maximum number of subscriptions.
    pub clients_at_cap: usize,
    /// Subscriptions still awaiting confirmation.
    pub awaiting_confirmation: usize,
    /// Subscriptions flagged inactive.
    pub inactive: usize,
    /// Subscriber count per stream.
    pub per_stream: HashMap<&'static str, usize>,
    /// Deliveries across all subscriptions.
    pub messages_sent: u64,
    /// Filter rejections across all subscriptions.
    pub messages_filtered: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn confirmed(registry: &SubscriptionRegistry, client: &str, stream: StreamType) {
        registry
            .subscribe_client(client, stream, SubscriptionFilter::default())
            .unwrap();
        registry.confirm_subscription(client, stream);
    }

    #[test]
    fn new_subscription_awaits_confirmation() {
        let registry = SubscriptionRegistry::default();
        let created = registry
            .subscribe_client("c1", StreamType::Signals, SubscriptionFilter::default())
            .unwrap();

        assert!(created);
        let snapshot = registry.subscription("c1", StreamType::Signals).unwrap();
        assert!(snapshot.awaiting_confirmation);
        assert!(!registry.should_send_to_client(
            "c1",
            StreamType::Signals,
            &json!({"symbol": "A", "signal_type": "buy"})
        ));
    }

    #[test]
    fn confirm_is_idempotent() {
        let registry = SubscriptionRegistry::default();
        confirmed(&registry, "c1", StreamType::Orders);
        let first = registry.subscription("c1", StreamType::Orders).unwrap();

        assert!(registry.confirm_subscription("c1", StreamType::Orders));
        let second = registry.subscription("c1", StreamType::Orders).unwrap();

        assert!(!second.awaiting_confirmation);
        assert_eq!(first.confirmed_at, second.confirmed_at);
        assert!(!registry.confirm_subscription("c1", StreamType::Portfolio));
    }

    #[test]
    fn resubscribe_replaces_filter_and_requires_new_confirmation() {
        let registry = SubscriptionRegistry::default();
        confirmed(&registry, "c1", StreamType::MarketData);

        let created = registry
            .subscribe_client(
                "c1",
                StreamType::MarketData,
                SubscriptionFilter::default().with_symbols(["ETH_USDT"]),
            )
            .unwrap();

        assert!(!created);
        let snapshot = registry.subscription("c1", StreamType::MarketData).unwrap();
        assert!(snapshot.awaiting_confirmation);
        assert!(snapshot.filter.symbols.contains("ETH_USDT"));
    }

    #[test]
    fn struct_literal_filter_is_normalized_on_subscribe() {
        let registry = SubscriptionRegistry::default();
        let filter = SubscriptionFilter {
            symbols: ["btc_usdt".to_string()].into(),
            timeframes: ["1H".to_string()].into(),
            ..Default::default()
        };
        registry
            .subscribe_client("c1", StreamType::MarketData, filter)
            .unwrap();
        registry.confirm_subscription("c1", StreamType::MarketData);

        assert!(registry.should_send_to_client(
            "c1",
            StreamType::MarketData,
            &json!({"symbol": "BTC_USDT", "timeframe": "1h"})
        ));
        assert!(!registry.should_send_to_client(
            "c1",
            StreamType::MarketData,
            &json!({"symbol": "ETH_USDT", "timeframe": "1h"})
        ));
    }

    #[test]
    fn filter_round_trips() {
        let registry = SubscriptionRegistry::default();
        let filter = SubscriptionFilter::from_params(&json!({
            "symbols": ["BTC_USDT", "ETH_USDT"],
            "timeframes": ["1m"],
            "min_volume": "100"
        }))
        .unwrap();

        registry
            .subscribe_client("c1", StreamType::MarketData, filter.clone())
            .unwrap();

        assert_eq!(registry.filters("c1", StreamType::MarketData), Some(filter));
    }

    #[test]
    fn per_client_cap_enforced() {
        let registry = SubscriptionRegistry::new(RegistryConfig {
            max_subscriptions_per_client: 2,
            ..Default::default()
        });

        confirmed(&registry, "c1", StreamType::MarketData);
        confirmed(&registry, "c1", StreamType::Signals);
        let err = registry
            .subscribe_client("c1", StreamType::Orders, SubscriptionFilter::default())
            .unwrap_err();

        assert_eq!(
            err,
            SubscriptionError::LimitExceeded {
                client_id: "c1".to_string(),
                limit: 2
            }
        );
        // Replacing an existing subscription is still allowed at the cap.
        assert!(
            registry
                .subscribe_client("c1", StreamType::Signals, SubscriptionFilter::default())
                .is_ok()
        );
        // Other clients are unaffected.
        confirmed(&registry, "c2", StreamType::Orders);
    }

    #[test]
    fn reverse_index_tracks_subscribers() {
        let registry = SubscriptionRegistry::default();
        confirmed(&registry, "c1", StreamType::MarketData);
        confirmed(&registry, "c2", StreamType::MarketData);
        confirmed(&registry, "c2", StreamType::Signals);

        let mut market = registry.subscribers(StreamType::MarketData);
        market.sort();
        assert_eq!(market, vec!["c1".to_string(), "c2".to_string()]);

        registry.unsubscribe_client("c1", StreamType::MarketData);
        assert_eq!(registry.subscribers(StreamType::MarketData), vec!["c2".to_string()]);
        assert!(registry.subscribers(StreamType::Portfolio).is_empty());
    }

    #[test]
    fn client_disconnected_removes_everything() {
        let registry = SubscriptionRegistry::default();
        confirmed(&registry, "c1", StreamType::MarketData);
        confirmed(&registry, "c1", StreamType::Signals);
        confirmed(&registry, "c2", StreamType::Signals);

        let mut removed = registry.client_disconnected("c1");
        removed.sort();

        assert_eq!(removed, vec![StreamType::MarketData, StreamType::Signals]);
        assert!(registry.client_subscriptions("c1").is_empty());
        assert_eq!(registry.subscribers(StreamType::Signals), vec!["c2".to_string()]);
        assert!(registry.client_disconnected("unknown").is_empty());
    }

    #[test]
    fn filter_rejections_are_counted() {
        let registry = SubscriptionRegistry::default();
        registry
            .subscribe_client(
                "c1",
                StreamType::MarketData,
                SubscriptionFilter::default().with_symbols(["BTC_USDT"]),
            )
            .unwrap();
        registry.confirm_subscription("c1", StreamType::MarketData);

        assert!(!registry.should_send_to_client(
            "c1",
            StreamType::MarketData,
            &json!({"symbol": "ETH_USDT"})
        ));
        registry.record_delivery("c1", StreamType::MarketData);

        let snapshot = registry.subscription("c1", StreamType::MarketData).unwrap();
        assert_eq!(snapshot.messages_filtered, 1);
        assert_eq!(snapshot.messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_marks_idle_subscriptions_inactive() {
        let registry = SubscriptionRegistry::default();
        confirmed(&registry, "idle", StreamType::MarketData);
        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        confirmed(&registry, "fresh", StreamType::MarketData);
        tokio::time::advance(Duration::from_secs(31 * 60)).await;

        assert_eq!(registry.sweep_inactive(), 1);
        assert_eq!(registry.sweep_inactive(), 0);

        let data = json!({"symbol": "BTC_USDT"});
        assert!(!registry.should_send_to_client("idle", StreamType::MarketData, &data));
        assert!(registry.should_send_to_client("fresh", StreamType::MarketData, &data));
        // Marked, not removed.
        assert_eq!(registry.stats().total_subscriptions, 2);

        registry.touch("idle");
        assert!(registry.should_send_to_client("idle", StreamType::MarketData, &data));
    }

    #[test]
    fn stats_are_accurate() {
        let registry = SubscriptionRegistry::default();
        confirmed(&registry, "c1", StreamType::MarketData);
        registry
            .subscribe_client("c2", StreamType::MarketData, SubscriptionFilter::default())
            .unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total_subscriptions, 2);
        assert_eq!(stats.client_count, 2);
        assert_eq!(stats.awaiting_confirmation, 1);
        assert_eq!(stats.per_stream.get("market_data"), Some(&2));
        assert_eq!(registry.health_check().status, crate::domain::health::HealthStatus::Healthy);
    }

    #[test]
    fn health_degrades_when_most_clients_hit_the_cap() {
        let registry = SubscriptionRegistry::new(RegistryConfig {
            max_subscriptions_per_client: 1,
            ..Default::default()
        });
        confirmed(&registry, "c1", StreamType::Orders);
        confirmed(&registry, "c2", StreamType::Orders);

        let health = registry.health_check();
        assert_eq!(health.status, crate::domain::health::HealthStatus::Degraded);
        assert_eq!(registry.stats().clients_at_cap, 2);
    }

    #[test]
    fn thread_safety_concurrent_subscriptions() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(SubscriptionRegistry::default());
        let mut handles = vec![];

        for i in 0..10 {
            let r = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let client = format!("c{i}");
                r.subscribe_client(&client, StreamType::MarketData, SubscriptionFilter::default())
                    .unwrap();
                r.confirm_subscription(&client, StreamType::MarketData);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.subscribers(StreamType::MarketData).len(), 10);
        assert_eq!(registry.stats().awaiting_confirmation, 0);
    }
}
