//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the config relay.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// HTTP listener for the API surface.
    pub listener: ListenerConfig,

    /// Backing-store endpoints and gateway behaviour.
    pub storage: StorageConfig,

    /// Background cluster probing.
    pub monitor: MonitorConfig,

    /// Watch-to-event translation.
    pub feed: FeedConfig,

    /// Live subscriber fan-out.
    pub hub: HubConfig,

    /// Read-through client cache.
    pub cache: CacheConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Per-request timeout for REST calls in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Backing-store gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Endpoint addresses, in preference order.
    pub endpoints: Vec<String>,

    /// Bound on every store RPC in milliseconds.
    pub rpc_timeout_ms: u64,

    /// Maximum endpoints tried per operation (capped at the endpoint count).
    pub retry_budget: usize,

    /// Largest accepted serialized value.
    pub max_value_bytes: usize,

    /// Change history retained by the in-process store for resumable watches.
    pub history_capacity: usize,
}

impl StorageConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "memory://node-0".to_string(),
                "memory://node-1".to_string(),
                "memory://node-2".to_string(),
            ],
            rpc_timeout_ms: 2000,
            retry_budget: 3,
            max_value_bytes: 1024 * 1024,
            history_capacity: 4096,
        }
    }
}

/// Cluster monitor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Enable background probing.
    pub enabled: bool,

    /// Probe round interval in milliseconds.
    pub interval_ms: u64,

    /// Per-probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Number of consecutive failed probes before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successful probes before marking healthy.
    pub healthy_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
            timeout_ms: 1000,
            unhealthy_threshold: 2,
            healthy_threshold: 1,
        }
    }
}

/// Change feed configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Events buffered between a feed worker and its consumer.
    pub channel_capacity: usize,

    /// Consecutive failed reconnect/resync attempts before giving up on a scope.
    pub resync_retry_budget: u32,

    /// Base reconnect delay in milliseconds.
    pub retry_base_ms: u64,

    /// Maximum reconnect delay in milliseconds.
    pub retry_max_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            resync_retry_budget: 5,
            retry_base_ms: 100,
            retry_max_ms: 5000,
        }
    }
}

/// Broadcast hub configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HubConfig {
    /// Per-subscriber queue bound; a full queue disconnects the subscriber.
    pub queue_capacity: usize,

    /// Reaper tick in seconds.
    pub heartbeat_interval_secs: u64,

    /// Subscriptions silent for longer than this are disconnected.
    pub heartbeat_timeout_secs: u64,
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
        }
    }
}

/// Client cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Freshness window of a fetched or pushed record in seconds.
    pub ttl_secs: u64,

    /// How long stale values may be served while fully disconnected.
    pub max_stale_secs: u64,

    /// Base push-channel reconnect delay in milliseconds.
    pub reconnect_base_ms: u64,

    /// Maximum push-channel reconnect delay in milliseconds.
    pub reconnect_max_ms: u64,

    /// Liveness signal interval towards the hub in seconds.
    pub heartbeat_interval_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn max_stale(&self) -> Duration {
        Duration::from_secs(self.max_stale_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            max_stale_secs: 30,
            reconnect_base_ms: 100,
            reconnect_max_ms: 10_000,
            heartbeat_interval_secs: 5,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Exporter bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "config_relay=info,tower_http=info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
