//! Bridge Configuration Settings
//!
//! Configuration types for the event stream bridge, loaded from
//! `STREAM_BRIDGE_*` environment variables with typed defaults.

use std::time::Duration;

use crate::application::services::broadcaster::BroadcasterConfig;
use crate::application::services::bridge::EventBridgeConfig;
use crate::application::services::session_tracker::SessionTrackerConfig;
use crate::domain::batch::BatchPolicy;
use crate::domain::subscription::RegistryConfig;
use crate::infrastructure::transport::HubConfig;

/// Broadcaster queue, latency and rate limit settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Broadcast queue bound.
    pub max_queue_size: usize,
    /// Enqueue wait before a message is dropped.
    pub enqueue_timeout: Duration,
    /// Latency breach threshold.
    pub latency_threshold: Duration,
    /// Latency breach threshold for critical streams.
    pub critical_latency_threshold: Duration,
    /// Token bucket capacity.
    pub token_bucket_max_tokens: f64,
    /// Token bucket refill per second.
    pub token_bucket_refill_rate: f64,
    /// Longest rate limiter wait.
    pub rate_limit_max_wait: Duration,
    /// Progress throttle window.
    pub progress_throttle_interval: Duration,
    /// Percentage movement that defeats the throttle.
    pub progress_min_delta: f64,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        let defaults = BroadcasterConfig::default();
        Self {
            max_queue_size: defaults.max_queue_size,
            enqueue_timeout: defaults.enqueue_timeout,
            latency_threshold: defaults.latency_threshold,
            critical_latency_threshold: defaults.critical_latency_threshold,
            token_bucket_max_tokens: defaults.rate_limit_max_tokens,
            token_bucket_refill_rate: defaults.rate_limit_refill_rate,
            rate_limit_max_wait: defaults.rate_limit_max_wait,
            progress_throttle_interval: defaults.progress_throttle_interval,
            progress_min_delta: defaults.progress_min_delta,
        }
    }
}

/// Batch aggregation settings.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Keys per batch before a size flush.
    pub max_batch_size: usize,
    /// Age of the oldest update before a time flush.
    pub batch_flush_interval: Duration,
    /// Flushed batches waiting per stream.
    pub max_pending_batches: usize,
    /// Serialized size ceiling of one batch envelope.
    pub max_message_size_bytes: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        let policy = BatchPolicy::default();
        Self {
            max_batch_size: policy.max_batch_size,
            batch_flush_interval: policy.flush_interval,
            max_pending_batches: policy.max_pending_batches,
            max_message_size_bytes: EventBridgeConfig::default().max_message_size_bytes,
        }
    }
}

/// Concurrency limits for dispatch and fan-out.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Concurrent immediate dispatch tasks in the bridge.
    pub immediate_dispatch_concurrency: usize,
    /// Concurrent client sends per broadcast.
    pub max_concurrent_broadcasts: usize,
    /// Outbound buffer per client.
    pub client_buffer: usize,
    /// Wait for room in a client's buffer before dropping.
    pub client_send_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        let hub = HubConfig::default();
        Self {
            immediate_dispatch_concurrency: EventBridgeConfig::default()
                .immediate_dispatch_concurrency,
            max_concurrent_broadcasts: hub.max_concurrent_broadcasts,
            client_buffer: hub.client_buffer,
            client_send_timeout: hub.send_timeout,
        }
    }
}

/// Execution session tracking settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Idle time before a session is evicted.
    pub session_ttl: Duration,
    /// Terminal results kept.
    pub history_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionTrackerConfig::default();
        Self {
            session_ttl: defaults.session_ttl,
            history_size: defaults.history_size,
        }
    }
}

/// Subscription registry settings.
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    /// Subscriptions allowed per client.
    pub max_subscriptions_per_client: usize,
    /// Idle time before a subscription is marked inactive.
    pub inactivity_timeout: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        let defaults = RegistryConfig::default();
        Self {
            max_subscriptions_per_client: defaults.max_subscriptions_per_client,
            inactivity_timeout: defaults.inactivity_timeout,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health, stats and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Broadcaster settings.
    pub broadcast: BroadcastSettings,
    /// Batch settings.
    pub batch: BatchSettings,
    /// Dispatch settings.
    pub dispatch: DispatchSettings,
    /// Session settings.
    pub session: SessionSettings,
    /// Subscription settings.
    pub subscription: SubscriptionSettings,
    /// Server settings.
    pub server: ServerSettings,
    /// Interval of every periodic maintenance sweep.
    pub cleanup_interval: Duration,
    /// Budget for each component's shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broadcast: BroadcastSettings::default(),
            batch: BatchSettings::default(),
            dispatch: DispatchSettings::default(),
            session: SessionSettings::default(),
            subscription: SubscriptionSettings::default(),
            server: ServerSettings::default(),
            cleanup_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup. Unset or
    /// unparsable keys fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a value fails validation.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let d = Self::default();

        let broadcast = BroadcastSettings {
            max_queue_size: env.parse("STREAM_BRIDGE_MAX_QUEUE_SIZE", d.broadcast.max_queue_size),
            enqueue_timeout: env.millis(
                "STREAM_BRIDGE_ENQUEUE_TIMEOUT_MS",
                d.broadcast.enqueue_timeout,
            ),
            latency_threshold: env.millis(
                "STREAM_BRIDGE_LATENCY_THRESHOLD_MS",
                d.broadcast.latency_threshold,
            ),
            critical_latency_threshold: env.millis(
                "STREAM_BRIDGE_CRITICAL_LATENCY_THRESHOLD_MS",
                d.broadcast.critical_latency_threshold,
            ),
            token_bucket_max_tokens: env.parse(
                "STREAM_BRIDGE_TOKEN_BUCKET_MAX_TOKENS",
                d.broadcast.token_bucket_max_tokens,
            ),
            token_bucket_refill_rate: env.parse(
                "STREAM_BRIDGE_TOKEN_BUCKET_REFILL_RATE",
                d.broadcast.token_bucket_refill_rate,
            ),
            rate_limit_max_wait: env.millis(
                "STREAM_BRIDGE_RATE_LIMIT_MAX_WAIT_MS",
                d.broadcast.rate_limit_max_wait,
            ),
            progress_throttle_interval: env.millis(
                "STREAM_BRIDGE_PROGRESS_THROTTLE_INTERVAL_MS",
                d.broadcast.progress_throttle_interval,
            ),
            progress_min_delta: env.parse(
                "STREAM_BRIDGE_PROGRESS_MIN_DELTA",
                d.broadcast.progress_min_delta,
            ),
        };

        let batch = BatchSettings {
            max_batch_size: env.parse("STREAM_BRIDGE_MAX_BATCH_SIZE", d.batch.max_batch_size),
            batch_flush_interval: env.millis(
                "STREAM_BRIDGE_BATCH_FLUSH_INTERVAL_MS",
                d.batch.batch_flush_interval,
            ),
            max_pending_batches: env.parse(
                "STREAM_BRIDGE_MAX_PENDING_BATCHES",
                d.batch.max_pending_batches,
            ),
            max_message_size_bytes: env.parse(
                "STREAM_BRIDGE_MAX_MESSAGE_SIZE_BYTES",
                d.batch.max_message_size_bytes,
            ),
        };

        let dispatch = DispatchSettings {
            immediate_dispatch_concurrency: env.parse(
                "STREAM_BRIDGE_IMMEDIATE_DISPATCH_CONCURRENCY",
                d.dispatch.immediate_dispatch_concurrency,
            ),
            max_concurrent_broadcasts: env.parse(
                "STREAM_BRIDGE_MAX_CONCURRENT_BROADCASTS",
                d.dispatch.max_concurrent_broadcasts,
            ),
            client_buffer: env.parse("STREAM_BRIDGE_CLIENT_BUFFER", d.dispatch.client_buffer),
            client_send_timeout: env.millis(
                "STREAM_BRIDGE_CLIENT_SEND_TIMEOUT_MS",
                d.dispatch.client_send_timeout,
            ),
        };

        let session = SessionSettings {
            session_ttl: env
                .parse::<u64>("STREAM_BRIDGE_SESSION_TTL_HOURS", 0)
                .checked_mul(3600)
                .filter(|secs| *secs > 0)
                .map_or(d.session.session_ttl, Duration::from_secs),
            history_size: env.parse("STREAM_BRIDGE_SESSION_HISTORY_SIZE", d.session.history_size),
        };

        let subscription = SubscriptionSettings {
            max_subscriptions_per_client: env.parse(
                "STREAM_BRIDGE_MAX_SUBSCRIPTIONS_PER_CLIENT",
                d.subscription.max_subscriptions_per_client,
            ),
            inactivity_timeout: env.secs(
                "STREAM_BRIDGE_SUBSCRIPTION_INACTIVITY_SECS",
                d.subscription.inactivity_timeout,
            ),
        };

        let config = Self {
            broadcast,
            batch,
            dispatch,
            session,
            subscription,
            server: ServerSettings {
                health_port: env.parse("STREAM_BRIDGE_HEALTH_PORT", d.server.health_port),
            },
            cleanup_interval: env.secs(
                "STREAM_BRIDGE_CLEANUP_INTERVAL_SECONDS",
                d.cleanup_interval,
            ),
            shutdown_timeout: env.secs("STREAM_BRIDGE_SHUTDOWN_TIMEOUT_SECS", d.shutdown_timeout),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first invalid key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive_rate = |key: &'static str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    key,
                    reason: format!("must be a positive number, got {value}"),
                })
            }
        };
        positive_rate(
            "STREAM_BRIDGE_TOKEN_BUCKET_MAX_TOKENS",
            self.broadcast.token_bucket_max_tokens,
        )?;
        positive_rate(
            "STREAM_BRIDGE_TOKEN_BUCKET_REFILL_RATE",
            self.broadcast.token_bucket_refill_rate,
        )?;

        let capacities = [
            ("STREAM_BRIDGE_MAX_QUEUE_SIZE", self.broadcast.max_queue_size),
            ("STREAM_BRIDGE_MAX_BATCH_SIZE", self.batch.max_batch_size),
            ("STREAM_BRIDGE_MAX_PENDING_BATCHES", self.batch.max_pending_batches),
            ("STREAM_BRIDGE_MAX_MESSAGE_SIZE_BYTES", self.batch.max_message_size_bytes),
            (
                "STREAM_BRIDGE_IMMEDIATE_DISPATCH_CONCURRENCY",
                self.dispatch.immediate_dispatch_concurrency,
            ),
            (
                "STREAM_BRIDGE_MAX_CONCURRENT_BROADCASTS",
                self.dispatch.max_concurrent_broadcasts,
            ),
            ("STREAM_BRIDGE_CLIENT_BUFFER", self.dispatch.client_buffer),
            (
                "STREAM_BRIDGE_MAX_SUBSCRIPTIONS_PER_CLIENT",
                self.subscription.max_subscriptions_per_client,
            ),
        ];
        if let Some((key, _)) = capacities.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid {
                key,
                reason: "must be at least 1".to_string(),
            });
        }

        if self.batch.batch_flush_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "STREAM_BRIDGE_BATCH_FLUSH_INTERVAL_MS",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "STREAM_BRIDGE_CLEANUP_INTERVAL_SECONDS",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Component configuration
    // -------------------------------------------------------------------------

    /// Batch policy for batched streams.
    #[must_use]
    pub const fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            max_batch_size: self.batch.max_batch_size,
            flush_interval: self.batch.batch_flush_interval,
            max_pending_batches: self.batch.max_pending_batches,
        }
    }

    /// Broadcaster configuration.
    #[must_use]
    pub fn broadcaster(&self) -> BroadcasterConfig {
        let b = &self.broadcast;
        BroadcasterConfig {
            max_queue_size: b.max_queue_size,
            enqueue_timeout: b.enqueue_timeout,
            latency_threshold: b.latency_threshold,
            critical_latency_threshold: b.critical_latency_threshold,
            rate_limit_max_tokens: b.token_bucket_max_tokens,
            rate_limit_refill_rate: b.token_bucket_refill_rate,
            rate_limit_max_wait: b.rate_limit_max_wait,
            progress_throttle_interval: b.progress_throttle_interval,
            progress_min_delta: b.progress_min_delta,
            cleanup_interval: self.cleanup_interval,
            shutdown_timeout: self.shutdown_timeout,
            ..BroadcasterConfig::default()
        }
    }

    /// Event bridge configuration.
    #[must_use]
    pub fn bridge(&self) -> EventBridgeConfig {
        EventBridgeConfig {
            immediate_dispatch_concurrency: self.dispatch.immediate_dispatch_concurrency,
            max_message_size_bytes: self.batch.max_message_size_bytes,
            pipeline_latency_threshold: self.broadcast.latency_threshold,
            shutdown_timeout: self.shutdown_timeout,
            ..EventBridgeConfig::default()
        }
    }

    /// Session tracker configuration.
    #[must_use]
    pub fn session_tracker(&self) -> SessionTrackerConfig {
        SessionTrackerConfig {
            session_ttl: self.session.session_ttl,
            history_size: self.session.history_size,
            cleanup_interval: self.cleanup_interval,
            ..SessionTrackerConfig::default()
        }
    }

    /// Subscription registry configuration.
    #[must_use]
    pub const fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            max_subscriptions_per_client: self.subscription.max_subscriptions_per_client,
            inactivity_timeout: self.subscription.inactivity_timeout,
        }
    }

    /// Client hub configuration.
    #[must_use]
    pub const fn hub(&self) -> HubConfig {
        HubConfig {
            max_concurrent_broadcasts: self.dispatch.max_concurrent_broadcasts,
            client_buffer: self.dispatch.client_buffer,
            send_timeout: self.dispatch.client_send_timeout,
            cleanup_interval: self.cleanup_interval,
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A value is out of range.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Environment variable.
        key: &'static str,
        /// What is wrong.
        reason: String,
    },
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.0)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
