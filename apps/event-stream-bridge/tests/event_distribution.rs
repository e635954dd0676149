//! Event Distribution Integration Tests
//!
//! Bus events flowing through the bridge, broadcaster and client hub.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use common::{Pipeline, drain, fast_config, next};
use event_stream_bridge::application::ports::EventBusPort;
use event_stream_bridge::{StreamProcessor, StreamType};
use serde_json::{Value, json};

fn items(messages: &[Value]) -> Vec<Value> {
    messages
        .iter()
        .flat_map(|m| match &m["data"] {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        })
        .collect()
}

#[tokio::test]
async fn symbol_filter_limits_market_data() {
    let pipeline = Pipeline::start(&fast_config());
    let mut rx = pipeline
        .client("c", "market_data", json!({"symbols": ["BTC_USDT"]}))
        .await;

    pipeline
        .bus
        .publish("market.price.BTC_USDT", json!({"symbol": "BTC_USDT", "price": 64_000.5}))
        .await;
    pipeline
        .bus
        .publish("market.price.ETH_USDT", json!({"symbol": "ETH_USDT", "price": 3_100.25}))
        .await;

    let messages = drain(&mut rx, Duration::from_millis(300)).await;
    assert!(!messages.is_empty());
    assert!(messages.iter().all(|m| m["stream"] == "market_data"));

    let delivered = items(&messages);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["symbol"], "BTC_USDT");

    pipeline.stop().await;
}

#[tokio::test]
async fn batch_keeps_latest_update_per_key() {
    let mut config = fast_config();
    config.batch.batch_flush_interval = Duration::from_millis(200);
    let pipeline = Pipeline::start(&config);
    let mut rx = pipeline.client("c", "indicators", json!(null)).await;

    for value in [40, 45, 50] {
        pipeline
            .bus
            .publish(
                "indicator.updated",
                json!({"symbol": "BTC_USDT", "indicator_type": "rsi", "period": 14, "value": value}),
            )
            .await;
    }

    let batch = next(&mut rx).await.expect("batch");
    assert_eq!(batch["type"], "batch");
    assert_eq!(batch["batch_size"], 1);
    assert_eq!(batch["data"][0]["value"], 50);

    pipeline.stop().await;
}

#[tokio::test]
async fn first_registered_processor_wins() {
    let config = fast_config();
    let processors = vec![
        StreamProcessor::new("primary", StreamType::SystemStatus)
            .pattern("indicator.*")
            .message_type("primary"),
        StreamProcessor::new("shadow", StreamType::SystemStatus)
            .pattern("indicator.updated")
            .message_type("shadow"),
    ];
    let pipeline = Pipeline::with_processors(&config, processors);
    let mut rx = pipeline.client("c", "system_status", json!(null)).await;

    for n in 0..5 {
        pipeline.bus.publish("indicator.updated", json!({"n": n})).await;
    }

    let messages = drain(&mut rx, Duration::from_millis(300)).await;
    assert_eq!(messages.len(), 5);
    assert!(messages.iter().all(|m| m["type"] == "primary"));
    assert_eq!(pipeline.bridge.route("indicator.updated"), Some("primary"));

    pipeline.stop().await;
}

#[tokio::test]
async fn unsubscribed_client_stops_receiving() {
    let pipeline = Pipeline::start(&fast_config());
    let mut rx = pipeline.client("c", "orders", json!(null)).await;

    pipeline
        .bus
        .publish("order.filled", json!({"order_id": "o-1", "symbol": "BTC_USDT"}))
        .await;
    let first = next(&mut rx).await.expect("order update");
    assert_eq!(first["type"], "order_update");
    assert_eq!(first["data"]["order_id"], "o-1");

    pipeline
        .hub
        .handle_command("c", &json!({"type": "unsubscribe", "stream": "orders"}))
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await.unwrap()["status"], "unsubscribed");

    pipeline
        .bus
        .publish("order.filled", json!({"order_id": "o-2"}))
        .await;
    assert!(drain(&mut rx, Duration::from_millis(200)).await.is_empty());

    pipeline.stop().await;
}

#[tokio::test]
async fn invalid_payloads_never_reach_clients() {
    let pipeline = Pipeline::start(&fast_config());
    let mut rx = pipeline.client("c", "signals", json!(null)).await;

    pipeline
        .bus
        .publish("signal.new", json!({"symbol": "BTC_USDT"}))
        .await;
    pipeline
        .bus
        .publish("signal.new", json!({"symbol": "BTC_USDT", "signal_type": "buy"}))
        .await;

    let messages = drain(&mut rx, Duration::from_millis(300)).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["data"]["signal_type"], "buy");
    assert_eq!(pipeline.broadcaster.get_stats().validation_failures, 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn stop_flushes_open_batches() {
    let mut config = fast_config();
    config.batch.batch_flush_interval = Duration::from_secs(60);
    let pipeline = Pipeline::start(&config);
    let mut rx = pipeline.client("c", "market_data", json!(null)).await;

    pipeline
        .bus
        .publish("market.price.SOL_USDT", json!({"symbol": "SOL_USDT", "price": 150}))
        .await;
    pipeline.stop().await;

    let messages = drain(&mut rx, Duration::from_millis(100)).await;
    let delivered = items(&messages);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["symbol"], "SOL_USDT");
    assert_eq!(pipeline.bus.handler_count(), 0);
}

#[tokio::test]
async fn invalid_batch_is_rejected_once() {
    let pipeline = Pipeline::start(&fast_config());
    let mut rx = pipeline.client("c", "indicators", json!(null)).await;

    pipeline
        .bus
        .publish("indicator.updated", json!({"symbol": "BTC_USDT", "value": 1}))
        .await;

    let messages = drain(&mut rx, Duration::from_millis(500)).await;
    assert!(messages.is_empty());
    assert_eq!(pipeline.broadcaster.get_stats().validation_failures, 1);
    let stats = pipeline.bridge.get_stats();
    assert_eq!(stats.batches_failed, 1);
    assert_eq!(stats.batches_sent, 0);

    pipeline.stop().await;
}
