//! Backpressure and Rate Limiting Integration Tests
//!
//! Bounded queue drops and token bucket behaviour seen from the public API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use event_stream_bridge::application::ports::{NoOpTransport, TransportError, TransportPort};
use event_stream_bridge::domain::rate_limit::TokenBucket;
use event_stream_bridge::{Broadcaster, BroadcasterConfig, ClientId, Envelope, StreamType};
use serde_json::json;

/// Transport whose deliveries never complete.
struct StuckTransport;

#[async_trait]
impl TransportPort for StuckTransport {
    async fn broadcast_to_subscribers(
        &self,
        _stream: StreamType,
        _envelope: Arc<Envelope>,
        _exclude_client: Option<ClientId>,
    ) -> Result<usize, TransportError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn saturated_queue_drops_without_failing() {
    let config = BroadcasterConfig {
        max_queue_size: 1,
        enqueue_timeout: Duration::from_millis(10),
        shutdown_timeout: Duration::from_millis(100),
        ..BroadcasterConfig::default()
    };
    let broadcaster = Arc::new(Broadcaster::new(config, Arc::new(StuckTransport)).unwrap());
    assert!(broadcaster.start());

    let calls = (0..100).map(|n| {
        let broadcaster = Arc::clone(&broadcaster);
        async move {
            broadcaster
                .broadcast_message(StreamType::SystemStatus, "status", json!({"n": n}), None)
                .await
        }
    });
    let accepted = futures::future::join_all(calls).await;

    let rejected = accepted.iter().filter(|ok| !**ok).count();
    assert!(rejected > 0);
    assert!(rejected < 100);
    let stats = broadcaster.get_stats();
    assert_eq!(stats.dropped_queue_full, rejected as u64);
    assert!(broadcaster.is_running());

    broadcaster.stop().await;
    assert!(!broadcaster.is_running());
}

#[tokio::test(start_paused = true)]
async fn token_bucket_refills_over_time() {
    let bucket = TokenBucket::new(5.0, 5.0).unwrap();
    for _ in 0..5 {
        assert!(bucket.acquire(1.0));
    }
    assert!(!bucket.acquire(1.0));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(bucket.acquire(1.0));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_streams_drop_and_exempt_streams_pass() {
    let config = BroadcasterConfig {
        rate_limit_max_tokens: 2.0,
        rate_limit_refill_rate: 0.001,
        rate_limit_max_wait: Duration::from_millis(5),
        ..BroadcasterConfig::default()
    };
    let broadcaster = Arc::new(Broadcaster::new(config, Arc::new(NoOpTransport)).unwrap());
    assert!(broadcaster.start());

    for n in 0..4 {
        assert!(
            broadcaster
                .broadcast_message(StreamType::SystemStatus, "status", json!({"n": n}), None)
                .await
        );
    }
    for n in 0..4 {
        assert!(
            broadcaster
                .broadcast_message(
                    StreamType::MarketData,
                    "price_update",
                    json!({"symbol": format!("S{n}")}),
                    None
                )
                .await
        );
    }

    for _ in 0..400 {
        let stats = broadcaster.get_stats();
        if stats.sent + stats.rate_limited == 8 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let stats = broadcaster.get_stats();
    assert_eq!(stats.rate_limited, 2);
    assert_eq!(stats.sent, 6);
    broadcaster.stop().await;
}
