//! Background cluster probing.
//!
//! # Responsibilities
//! - Probe every endpoint on a fixed interval, independent of foreground calls
//! - Feed probe outcomes into each endpoint's health hysteresis
//! - Publish the result of the last completed round as a [`ClusterSnapshot`]

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};

use crate::config::MonitorConfig;
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::model::epoch_millis;
use crate::storage::{Endpoint, HealthState, StorageGateway};

/// One endpoint as of a completed probe round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub address: String,
    pub health: HealthState,
    pub leader: bool,
    /// Milliseconds since the unix epoch.
    pub last_probe_at: Option<u64>,
}

impl EndpointStatus {
    fn of(endpoint: &Endpoint) -> Self {
        Self {
            address: endpoint.address.clone(),
            health: endpoint.health(),
            leader: endpoint.is_leader(),
            last_probe_at: endpoint.last_probe_at(),
        }
    }
}

/// Health and leadership of every endpoint, in configured order.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    /// 0 until the first round completes.
    pub round: u64,
    pub endpoints: Vec<EndpointStatus>,
}

impl ClusterSnapshot {
    pub fn leader(&self) -> Option<&EndpointStatus> {
        self.endpoints.iter().find(|e| e.leader)
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|e| e.health == HealthState::Healthy)
            .count()
    }
}

/// Periodic prober for the gateway's endpoints.
pub struct ClusterMonitor {
    gateway: Arc<StorageGateway>,
    config: MonitorConfig,
    latest: ArcSwap<ClusterSnapshot>,
    rounds: AtomicU64,
}

impl ClusterMonitor {
    pub fn new(gateway: Arc<StorageGateway>, config: MonitorConfig) -> Self {
        let initial = ClusterSnapshot {
            round: 0,
            endpoints: gateway.endpoints().iter().map(|e| EndpointStatus::of(e)).collect(),
        };
        Self {
            gateway,
            config,
            latest: ArcSwap::from_pointee(initial),
            rounds: AtomicU64::new(0),
        }
    }

    /// Last completed round. Never waits on a round in flight.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.latest.load_full()
    }

    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        if !self.config.enabled {
            tracing::info!("Cluster monitor disabled");
            return;
        }

        tracing::info!(
            interval_ms = self.config.interval_ms,
            endpoints = self.gateway.endpoints().len(),
            "Cluster monitor starting"
        );

        let mut ticker = time::interval(Duration::from_millis(self.config.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_round().await;
                }
                _ = shutdown.wait() => {
                    tracing::info!("Cluster monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every endpoint concurrently and publish the outcome.
    pub async fn probe_round(&self) -> Arc<ClusterSnapshot> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let probes = self
            .gateway
            .endpoints()
            .iter()
            .map(|endpoint| self.probe(endpoint, timeout));
        join_all(probes).await;

        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = Arc::new(ClusterSnapshot {
            round,
            endpoints: self
                .gateway
                .endpoints()
                .iter()
                .map(|e| EndpointStatus::of(e))
                .collect(),
        });
        self.latest.store(snapshot.clone());
        tracing::debug!(round, healthy = snapshot.healthy_count(), "Probe round complete");
        snapshot
    }

    async fn probe(&self, endpoint: &Endpoint, timeout: Duration) {
        if endpoint.is_forced_down() {
            endpoint.probe_failed(epoch_millis(), self.config.unhealthy_threshold as usize, "forced down");
            return;
        }

        let client = endpoint.client();
        match time::timeout(timeout, client.status()).await {
            Ok(Ok(status)) => {
                endpoint.probe_succeeded(status.is_leader, epoch_millis(), self.config.healthy_threshold as usize);
            }
            Ok(Err(e)) => {
                tracing::debug!(endpoint = %endpoint.address, error = %e, "Probe failed");
                endpoint.probe_failed(epoch_millis(), self.config.unhealthy_threshold as usize, "probe failed");
            }
            Err(_) => {
                tracing::debug!(endpoint = %endpoint.address, "Probe timed out");
                endpoint.probe_failed(epoch_millis(), self.config.unhealthy_threshold as usize, "probe timed out");
            }
        }
    }

    /// Make the listed endpoints fail every probe and every gateway attempt
    /// until revived. Unknown addresses are ignored.
    #[cfg(any(test, feature = "chaos"))]
    pub fn force_down(&self, addresses: &[&str]) {
        self.set_forced(addresses, true);
    }

    #[cfg(any(test, feature = "chaos"))]
    pub fn revive(&self, addresses: &[&str]) {
        self.set_forced(addresses, false);
    }

    #[cfg(any(test, feature = "chaos"))]
    fn set_forced(&self, addresses: &[&str], down: bool) {
        for endpoint in self.gateway.endpoints() {
            if addresses.contains(&endpoint.address.as_str()) {
                tracing::warn!(endpoint = %endpoint.address, down, "Chaos override applied");
                endpoint.set_forced_down(down);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::model::{ConfigKey, ConfigMetadata};
    use crate::storage::{GatewayError, MemoryCluster};

    fn monitor(cluster: &MemoryCluster) -> Arc<ClusterMonitor> {
        let gateway = Arc::new(StorageGateway::new(cluster.backends(), StorageConfig::default()));
        let config = MonitorConfig {
            timeout_ms: 100,
            unhealthy_threshold: 1,
            ..MonitorConfig::default()
        };
        Arc::new(ClusterMonitor::new(gateway, config))
    }

    #[tokio::test]
    async fn test_round_reports_health_and_leader() {
        let cluster = MemoryCluster::with_nodes(3);
        cluster.set_leader(1);
        cluster.set_reachable(2, false);
        let monitor = monitor(&cluster);

        assert_eq!(monitor.snapshot().round, 0);
        let snap = monitor.probe_round().await;
        assert_eq!(snap.round, 1);
        assert_eq!(snap.endpoints[0].health, HealthState::Healthy);
        assert_eq!(snap.endpoints[2].health, HealthState::Unhealthy);
        assert_eq!(snap.leader().map(|e| e.address.as_str()), Some("memory://node-1"));
        assert!(snap.endpoints.iter().all(|e| e.last_probe_at.is_some()));
    }

    #[tokio::test]
    async fn test_recovery_detected_by_probe() {
        let cluster = MemoryCluster::with_nodes(2);
        let monitor = monitor(&cluster);
        cluster.set_reachable(0, false);
        monitor.probe_round().await;
        assert_eq!(monitor.snapshot().endpoints[0].health, HealthState::Unhealthy);

        cluster.set_reachable(0, true);
        monitor.probe_round().await;
        assert_eq!(monitor.snapshot().endpoints[0].health, HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_never_waits_for_round_in_flight() {
        let cluster = MemoryCluster::with_nodes(2);
        let monitor = monitor(&cluster);
        monitor.probe_round().await;

        cluster.set_latency(1, Duration::from_secs(60));
        let background = monitor.clone();
        let round = tokio::spawn(async move { background.probe_round().await });
        tokio::task::yield_now().await;

        // Round 2 is still waiting on node 1's probe timeout.
        assert_eq!(monitor.snapshot().round, 1);
        let finished = round.await.unwrap();
        assert_eq!(finished.round, 2);
        assert_eq!(finished.endpoints[1].health, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_force_down_and_revive() {
        let cluster = MemoryCluster::with_nodes(2);
        let monitor = monitor(&cluster);
        monitor.force_down(&["memory://node-0"]);
        monitor.probe_round().await;
        assert_eq!(monitor.snapshot().endpoints[0].health, HealthState::Unhealthy);

        // Gateway routes around the forced endpoint.
        let key = ConfigKey::parse("svc", "prod", "k").unwrap();
        monitor.gateway.put(&key, 1.into(), ConfigMetadata::new("t", "unit")).await.unwrap();
        assert_eq!(monitor.gateway.preferred().unwrap().index, 1);

        monitor.force_down(&["memory://node-1"]);
        assert!(matches!(
            monitor.gateway.get(&key).await,
            Err(GatewayError::Unavailable { .. })
        ));

        monitor.revive(&["memory://node-0", "memory://node-1"]);
        monitor.probe_round().await;
        assert_eq!(monitor.snapshot().healthy_count(), 2);
    }

    #[tokio::test]
    async fn test_forced_minority_leaves_every_operation_working() {
        let cluster = MemoryCluster::with_nodes(5);
        let monitor = monitor(&cluster);
        monitor.force_down(&["memory://node-0", "memory://node-1"]);
        let gateway = &monitor.gateway;
        let scope = crate::model::Scope::new("svc", "prod").unwrap();
        let meta = || ConfigMetadata::new("t", "unit");

        let mut watch = gateway.watch(&scope, None).await.unwrap();
        assert!(watch.endpoint().index >= 2);

        for name in ["a", "b"] {
            let key = scope.key(name).unwrap();
            gateway.put(&key, 1.into(), meta()).await.unwrap();
        }
        let keys: Vec<_> = gateway.get_all(&scope).await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, ["a", "b"]);

        let deleted = gateway.delete(&scope.key("a").unwrap()).await.unwrap();
        assert!(matches!(
            gateway.get(&scope.key("a").unwrap()).await,
            Err(GatewayError::NotFound(_))
        ));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let change = time::timeout(Duration::from_secs(5), watch.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push((change.kind, change.key, change.version));
        }
        assert_eq!(seen[2], (crate::model::ChangeKind::Delete, "a".to_string(), deleted));

        monitor.probe_round().await;
        let snap = monitor.snapshot();
        assert_eq!(snap.healthy_count(), 3);
        assert!(snap.endpoints[..2].iter().all(|e| e.health == HealthState::Unhealthy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let cluster = MemoryCluster::with_nodes(1);
        let monitor = monitor(&cluster);
        let shutdown = crate::lifecycle::shutdown::Shutdown::new();
        let task = tokio::spawn(monitor.clone().run(shutdown.subscribe()));

        time::sleep(Duration::from_millis(12_000)).await;
        assert!(monitor.snapshot().round >= 2);
        shutdown.trigger();
        task.await.unwrap();
    }
}
