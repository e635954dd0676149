//! Configuration Module
//!
//! Environment-driven configuration for the bridge and the conversions
//! into each component's own config type.

mod settings;

pub use settings::{
    BatchSettings, BridgeConfig, BroadcastSettings, ConfigError, DispatchSettings, ServerSettings,
    SessionSettings, SubscriptionSettings,
};
