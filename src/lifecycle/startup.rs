//! Runtime assembly.
//!
//! # Responsibilities
//! - Build every subsystem from a validated configuration, leaf first
//! - Own the long-running tasks (monitor, hub reaper, cache sync loops)
//! - Tear them down in order on shutdown
//!
//! # Design Decisions
//! - One explicitly owned runtime object instead of process-wide registries
//! - Endpoint addresses select the backend; `memory://` is built in

use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::cache::{ClientCache, SchemaDefaults};
use crate::config::RelayConfig;
use crate::feed::ChangeFeed;
use crate::health::ClusterMonitor;
use crate::hub::BroadcastHub;
use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal};
use crate::model::Scope;
use crate::storage::{KvBackend, MemoryCluster, StorageGateway};

/// How long shutdown waits for background tasks.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("endpoint {0:?} uses an unsupported scheme (expected memory://)")]
    UnsupportedEndpoint(String),
}

/// Build the in-process cluster described by `storage.endpoints`.
pub fn memory_cluster(config: &RelayConfig) -> Result<MemoryCluster, StartupError> {
    if let Some(foreign) = config
        .storage
        .endpoints
        .iter()
        .find(|e| !e.starts_with("memory://"))
    {
        return Err(StartupError::UnsupportedEndpoint(foreign.clone()));
    }
    Ok(MemoryCluster::new(
        config.storage.endpoints.clone(),
        config.storage.history_capacity,
    ))
}

/// Every component of a running relay.
pub struct RelayRuntime {
    config: RelayConfig,
    gateway: Arc<StorageGateway>,
    monitor: Arc<ClusterMonitor>,
    feed: ChangeFeed,
    hub: BroadcastHub,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayRuntime {
    /// Wire the subsystems together. Nothing runs until [`RelayRuntime::start`].
    pub fn build(config: RelayConfig, backends: Vec<(String, Arc<dyn KvBackend>)>) -> Self {
        let gateway = Arc::new(StorageGateway::new(backends, config.storage.clone()));
        let monitor = Arc::new(ClusterMonitor::new(gateway.clone(), config.monitor.clone()));
        let feed = ChangeFeed::new(gateway.clone(), config.feed.clone());
        let hub = BroadcastHub::new(feed.clone(), config.hub.clone());

        tracing::info!(
            endpoints = gateway.endpoints().len(),
            retry_budget = config.storage.retry_budget,
            "Relay runtime assembled"
        );

        Self {
            config,
            gateway,
            monitor,
            feed,
            hub,
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the cluster monitor and the hub's heartbeat reaper.
    pub fn start(&self) {
        let monitor = tokio::spawn(self.monitor.clone().run(self.shutdown.subscribe()));
        let reaper = tokio::spawn(self.hub.clone().run(self.shutdown.subscribe()));
        self.track(monitor);
        self.track(reaper);
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<StorageGateway> {
        &self.gateway
    }

    pub fn monitor(&self) -> &Arc<ClusterMonitor> {
        &self.monitor
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.subscribe()
    }

    /// A cache for `scope`, kept in sync until shutdown.
    pub fn cache(&self, scope: Scope, schema: Option<Arc<dyn SchemaDefaults>>) -> ClientCache {
        let cache = ClientCache::new(
            scope,
            self.gateway.clone(),
            self.hub.clone(),
            schema,
            self.config.cache.clone(),
        );
        self.track(cache.spawn(self.shutdown.subscribe()));
        cache
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().expect("runtime task mutex poisoned").push(handle);
    }

    /// Signal every task, disconnect subscribers, and wait for the tasks to
    /// finish (bounded).
    pub async fn shutdown(&self) {
        tracing::info!("Relay runtime shutting down");
        self.shutdown.trigger();
        self.hub.close();

        let tasks = std::mem::take(&mut *self.tasks.lock().expect("runtime task mutex poisoned"));
        let count = tasks.len();
        let drain = futures_util::future::join_all(tasks);
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!(tasks = count, "Background tasks did not stop in time");
        } else {
            tracing::info!(tasks = count, "Background tasks stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConfigKey, ConfigMetadata, ConfigValue};

    #[test]
    fn test_memory_cluster_rejects_foreign_schemes() {
        let mut config = RelayConfig::default();
        assert_eq!(memory_cluster(&config).unwrap().node_count(), 3);
        config.storage.endpoints.push("http://etcd:2379".into());
        assert!(matches!(
            memory_cluster(&config),
            Err(StartupError::UnsupportedEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_runtime_serves_cache_and_shuts_down() {
        let config = RelayConfig::default();
        let cluster = memory_cluster(&config).unwrap();
        let runtime = RelayRuntime::build(config, cluster.backends());
        runtime.start();

        let key = ConfigKey::parse("svc", "prod", "a").unwrap();
        runtime
            .gateway()
            .put(&key, 1.into(), ConfigMetadata::new("t", "unit"))
            .await
            .unwrap();
        let cache = runtime.cache(key.scope().clone(), None);
        assert_eq!(cache.get("a", None).await.unwrap(), ConfigValue::from(1));

        runtime.shutdown().await;
    }
}
