//! Shared pipeline harness for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use event_stream_bridge::application::ports::{EventBusPort, TransportPort};
use event_stream_bridge::{
    BridgeConfig, Broadcaster, ClientHub, EventBridge, InMemoryEventBus, SessionProgressTracker,
    StreamProcessor, SubscriptionRegistry, default_processors,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Every component wired the way the binary wires them.
pub struct Pipeline {
    pub bus: Arc<InMemoryEventBus>,
    pub hub: Arc<ClientHub>,
    pub broadcaster: Arc<Broadcaster>,
    pub bridge: Arc<EventBridge>,
    pub tracker: Arc<SessionProgressTracker>,
}

/// Configuration with short timers so tests finish quickly.
pub fn fast_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.batch.batch_flush_interval = Duration::from_millis(20);
    config.shutdown_timeout = Duration::from_millis(500);
    config
}

impl Pipeline {
    pub fn start(config: &BridgeConfig) -> Self {
        Self::with_processors(config, default_processors(config.batch_policy()))
    }

    pub fn with_processors(config: &BridgeConfig, processors: Vec<StreamProcessor>) -> Self {
        let bus = Arc::new(InMemoryEventBus::new());
        let bus_port: Arc<dyn EventBusPort> = Arc::clone(&bus) as Arc<dyn EventBusPort>;
        let registry = Arc::new(SubscriptionRegistry::new(config.registry()));
        let hub = Arc::new(ClientHub::new(config.hub(), registry));
        let transport: Arc<dyn TransportPort> = Arc::clone(&hub) as Arc<dyn TransportPort>;

        let broadcaster = Arc::new(Broadcaster::new(config.broadcaster(), transport).unwrap());
        let bridge = Arc::new(
            EventBridge::new(
                config.bridge(),
                processors,
                Arc::clone(&bus_port),
                Arc::clone(&broadcaster),
            )
            .unwrap(),
        );
        let tracker = Arc::new(SessionProgressTracker::new(
            config.session_tracker(),
            bus_port,
        ));

        assert!(hub.start());
        assert!(broadcaster.start());
        assert!(tracker.start());
        assert!(bridge.start());

        Self {
            bus,
            hub,
            broadcaster,
            bridge,
            tracker,
        }
    }

    pub async fn stop(&self) {
        self.bridge.stop().await;
        self.tracker.stop().await;
        self.broadcaster.stop().await;
        self.hub.stop().await;
    }

    /// Connect a client and subscribe it, consuming the ack.
    pub async fn client(&self, client_id: &str, stream: &str, params: Value) -> mpsc::Receiver<Value> {
        let mut rx = self.hub.connect(client_id).unwrap();
        self.hub
            .handle_command(
                client_id,
                &json!({"type": "subscribe", "stream": stream, "params": params, "id": client_id}),
            )
            .await
            .unwrap();
        let ack = next(&mut rx).await.expect("subscription ack");
        assert_eq!(ack["type"], "subscription_ack");
        rx
    }
}

/// Next message, or `None` after a short wait.
pub async fn next(rx: &mut mpsc::Receiver<Value>) -> Option<Value> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

/// Every message that arrives within `window`.
pub async fn drain(rx: &mut mpsc::Receiver<Value>, window: Duration) -> Vec<Value> {
    let mut messages = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(message)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        messages.push(message);
    }
    messages
}
