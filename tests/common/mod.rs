//! Shared builders for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use config_relay::config::RelayConfig;
use config_relay::lifecycle::RelayRuntime;
use config_relay::model::{ConfigKey, ConfigMetadata, Scope};
use config_relay::storage::{MemoryCluster, StorageGateway};

pub const NAMESPACE: &str = "checkout";
pub const ENVIRONMENT: &str = "prod";

/// Configuration with short timeouts and fast retries, one endpoint per node.
pub fn fast_config(nodes: usize) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.storage.endpoints = (0..nodes).map(|i| format!("memory://node-{}", i)).collect();
    config.storage.rpc_timeout_ms = 200;
    config.storage.retry_budget = nodes;
    config.monitor.interval_ms = 100;
    config.monitor.timeout_ms = 50;
    config.feed.retry_base_ms = 10;
    config.feed.retry_max_ms = 50;
    config.feed.resync_retry_budget = 50;
    config.cache.reconnect_base_ms = 10;
    config.cache.reconnect_max_ms = 100;
    config.observability.metrics_enabled = false;
    config
}

/// A cluster plus an assembled (not started) runtime over it.
pub fn runtime(config: RelayConfig) -> (MemoryCluster, Arc<RelayRuntime>) {
    let cluster = MemoryCluster::new(config.storage.endpoints.clone(), config.storage.history_capacity);
    let runtime = Arc::new(RelayRuntime::build(config, cluster.backends()));
    (cluster, runtime)
}

/// A gateway over a subset of the cluster's nodes.
pub fn gateway_over(cluster: &MemoryCluster, nodes: &[usize], config: &RelayConfig) -> Arc<StorageGateway> {
    let backends = cluster
        .backends()
        .into_iter()
        .enumerate()
        .filter(|(i, _)| nodes.contains(i))
        .map(|(_, backend)| backend)
        .collect();
    Arc::new(StorageGateway::new(backends, config.storage.clone()))
}

pub fn scope() -> Scope {
    Scope::new(NAMESPACE, ENVIRONMENT).unwrap()
}

pub fn key(name: &str) -> ConfigKey {
    scope().key(name).unwrap()
}

pub fn meta() -> ConfigMetadata {
    ConfigMetadata::new("integration", "test")
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
