//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate endpoint addresses and detect duplicates
//! - Validate value ranges (timeouts > 0, capacities > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RelayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;

use crate::config::schema::RelayConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &RelayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("{:?} is not a socket address", config.listener.bind_address),
        ));
    }

    let storage = &config.storage;
    if storage.endpoints.is_empty() {
        errors.push(ValidationError::new("storage.endpoints", "at least one endpoint is required"));
    }
    let mut seen = HashSet::new();
    for endpoint in &storage.endpoints {
        if url::Url::parse(endpoint).is_err() {
            errors.push(ValidationError::new(
                "storage.endpoints",
                format!("{:?} is not a valid URL", endpoint),
            ));
        }
        if !seen.insert(endpoint.as_str()) {
            errors.push(ValidationError::new(
                "storage.endpoints",
                format!("{:?} is listed more than once", endpoint),
            ));
        }
    }

    let positive: [(&'static str, u64); 14] = [
        ("listener.request_timeout_secs", config.listener.request_timeout_secs),
        ("storage.rpc_timeout_ms", storage.rpc_timeout_ms),
        ("storage.retry_budget", storage.retry_budget as u64),
        ("storage.max_value_bytes", storage.max_value_bytes as u64),
        ("storage.history_capacity", storage.history_capacity as u64),
        ("monitor.interval_ms", config.monitor.interval_ms),
        ("monitor.timeout_ms", config.monitor.timeout_ms),
        ("feed.channel_capacity", config.feed.channel_capacity as u64),
        ("feed.retry_base_ms", config.feed.retry_base_ms),
        ("hub.queue_capacity", config.hub.queue_capacity as u64),
        ("hub.heartbeat_interval_secs", config.hub.heartbeat_interval_secs),
        ("cache.ttl_secs", config.cache.ttl_secs),
        ("cache.reconnect_base_ms", config.cache.reconnect_base_ms),
        ("cache.heartbeat_interval_secs", config.cache.heartbeat_interval_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if config.monitor.unhealthy_threshold == 0 || config.monitor.healthy_threshold == 0 {
        errors.push(ValidationError::new("monitor", "thresholds must be at least 1"));
    }
    if config.feed.retry_max_ms < config.feed.retry_base_ms {
        errors.push(ValidationError::new("feed.retry_max_ms", "must not be below retry_base_ms"));
    }
    if config.cache.reconnect_max_ms < config.cache.reconnect_base_ms {
        errors.push(ValidationError::new(
            "cache.reconnect_max_ms",
            "must not be below reconnect_base_ms",
        ));
    }
    if config.hub.heartbeat_timeout_secs <= config.hub.heartbeat_interval_secs {
        errors.push(ValidationError::new(
            "hub.heartbeat_timeout_secs",
            "must exceed heartbeat_interval_secs",
        ));
    }
    if config.cache.heartbeat_interval_secs >= config.hub.heartbeat_timeout_secs {
        errors.push(ValidationError::new(
            "cache.heartbeat_interval_secs",
            "must be shorter than hub.heartbeat_timeout_secs",
        ));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<std::net::SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
