//! Multi-endpoint storage gateway.
//!
//! # Responsibilities
//! - Execute get/get_all/put/delete/watch against an ordered endpoint list
//! - Fail over to the next endpoint on timeout or connection failure
//! - Validate keys and values before any write reaches the store
//!
//! # Design Decisions
//! - A transparent multiplexer with failover, not a consensus layer: the
//!   consistency of every answer is exactly the backing store's
//! - One preferred endpoint; the endpoint that last served a call becomes it
//! - Endpoints believed unhealthy are tried last, not skipped, so a call can
//!   still succeed before the monitor notices a recovery
//! - Attempts are capped at min(N, retry_budget)
//! - Retried writes may apply twice; the later one simply wins by version

use futures_util::future::BoxFuture;
use futures_util::stream::StreamExt;
use futures_util::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::StorageConfig;
use crate::model::{ChangeKind, ConfigEntry, ConfigKey, ConfigMetadata, ConfigValue, Scope, Version};
use crate::observability::metrics;
use crate::resilience::timeouts::with_deadline;
use crate::storage::backend::{KvBackend, PutCondition, StoreError, WatchEvent, WatchStream};
use crate::storage::codec;
use crate::storage::endpoint::Endpoint;
use crate::storage::error::GatewayError;

/// Every entry of a scope as of one store revision.
#[derive(Debug, Clone)]
pub struct ScopeSnapshot {
    /// Key-sorted.
    pub entries: Vec<ConfigEntry>,
    pub revision: Version,
}

/// A change read from a watch, decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub kind: ChangeKind,
    pub key: String,
    /// Present for puts.
    pub entry: Option<ConfigEntry>,
    /// Entry version for puts, deletion revision for deletes.
    pub version: Version,
}

/// Storage gateway over N replicated endpoints.
#[derive(Debug)]
pub struct StorageGateway {
    endpoints: Vec<Arc<Endpoint>>,
    preferred: AtomicUsize,
    config: StorageConfig,
}

impl StorageGateway {
    /// Create a gateway; the first endpoint starts as preferred.
    pub fn new(backends: Vec<(String, Arc<dyn KvBackend>)>, config: StorageConfig) -> Self {
        let endpoints = backends
            .into_iter()
            .enumerate()
            .map(|(index, (address, client))| Arc::new(Endpoint::new(index, address, client)))
            .collect();
        Self {
            endpoints,
            preferred: AtomicUsize::new(0),
            config,
        }
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn preferred(&self) -> Option<Arc<Endpoint>> {
        self.endpoints
            .get(self.preferred.load(Ordering::Relaxed))
            .cloned()
    }

    /// True while at least one endpoint is healthy or not yet probed.
    pub fn has_usable_endpoint(&self) -> bool {
        self.endpoints.iter().any(|e| e.is_usable())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Read one key.
    pub async fn get(&self, key: &ConfigKey) -> Result<ConfigEntry, GatewayError> {
        let path = key.path();
        let (kv, _) = self
            .execute("get", |client| {
                let path = path.clone();
                async move { client.get(&path).await }.boxed()
            })
            .await?;
        let kv = kv.ok_or_else(|| GatewayError::NotFound(key.to_string()))?;
        codec::decode(&kv).map_err(|e| {
            tracing::error!(key = %key, error = %e, "Stored value is unreadable");
            GatewayError::InvalidValue(e.to_string())
        })
    }

    /// All entries of a scope, key-sorted.
    pub async fn get_all(&self, scope: &Scope) -> Result<Vec<ConfigEntry>, GatewayError> {
        Ok(self.snapshot(scope).await?.entries)
    }

    /// All entries of a scope together with the revision they were read at.
    pub async fn snapshot(&self, scope: &Scope) -> Result<ScopeSnapshot, GatewayError> {
        let prefix = scope.prefix();
        let (range, _) = self
            .execute("range", |client| {
                let prefix = prefix.clone();
                async move { client.range(&prefix).await }.boxed()
            })
            .await?;

        let mut entries = Vec::with_capacity(range.kvs.len());
        for kv in &range.kvs {
            match codec::decode(kv) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::error!(scope = %scope, error = %e, "Skipping unreadable stored value"),
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(ScopeSnapshot {
            entries,
            revision: Version::new(range.revision),
        })
    }

    /// Unconditional write; last write wins by version.
    pub async fn put(
        &self,
        key: &ConfigKey,
        value: ConfigValue,
        metadata: ConfigMetadata,
    ) -> Result<Version, GatewayError> {
        self.write(key, value, metadata, PutCondition::Always).await
    }

    /// Conditional write: `None` requires the key to be absent, `Some(v)`
    /// requires its current version to be `v`.
    pub async fn put_if(
        &self,
        key: &ConfigKey,
        value: ConfigValue,
        metadata: ConfigMetadata,
        expected: Option<Version>,
    ) -> Result<Version, GatewayError> {
        let condition = match expected {
            None => PutCondition::Absent,
            Some(v) => PutCondition::Revision(v.revision()),
        };
        self.write(key, value, metadata, condition).await
    }

    async fn write(
        &self,
        key: &ConfigKey,
        value: ConfigValue,
        metadata: ConfigMetadata,
        condition: PutCondition,
    ) -> Result<Version, GatewayError> {
        let blob = self.validate_value(&value, &metadata)?;
        let path = key.path();
        let (revision, endpoint) = self
            .execute("put", |client| {
                let path = path.clone();
                let blob = blob.clone();
                async move { client.put(&path, blob, condition).await }.boxed()
            })
            .await?;
        tracing::debug!(key = %key, revision, endpoint = %endpoint.address, "Configuration written");
        Ok(Version::new(revision))
    }

    /// Delete one key; returns the deletion revision.
    pub async fn delete(&self, key: &ConfigKey) -> Result<Version, GatewayError> {
        let path = key.path();
        let (deleted, _) = self
            .execute("delete", |client| {
                let path = path.clone();
                async move { client.delete(&path).await }.boxed()
            })
            .await?;
        deleted
            .map(Version::new)
            .ok_or_else(|| GatewayError::NotFound(key.to_string()))
    }

    /// Open a watch on a scope, resuming after `resume_from` when given,
    /// otherwise starting at the next change.
    pub async fn watch(&self, scope: &Scope, resume_from: Option<Version>) -> Result<ScopeWatch, GatewayError> {
        let prefix = scope.prefix();
        let start = resume_from.map(|v| v.revision() + 1);
        let (stream, endpoint) = self
            .execute("watch", |client| {
                let prefix = prefix.clone();
                async move { client.watch(&prefix, start).await }.boxed()
            })
            .await?;
        tracing::debug!(scope = %scope, endpoint = %endpoint.address, start = ?start, "Watch opened");
        Ok(ScopeWatch {
            scope: scope.clone(),
            endpoint,
            inner: stream,
        })
    }

    fn validate_value(&self, value: &ConfigValue, metadata: &ConfigMetadata) -> Result<Vec<u8>, GatewayError> {
        if metadata.created_by.trim().is_empty() {
            return Err(GatewayError::InvalidValue("metadata.created_by is required".into()));
        }
        let blob = codec::encode(value, metadata).map_err(|e| GatewayError::InvalidValue(e.to_string()))?;
        if blob.len() > self.config.max_value_bytes {
            return Err(GatewayError::InvalidValue(format!(
                "value is {} bytes, limit is {}",
                blob.len(),
                self.config.max_value_bytes
            )));
        }
        Ok(blob)
    }

    /// Preferred endpoint first, then ring order; endpoints believed
    /// unhealthy go last.
    fn attempt_order(&self) -> Vec<Arc<Endpoint>> {
        let n = self.endpoints.len();
        let start = self.preferred.load(Ordering::Relaxed);
        let (mut usable, unusable): (Vec<_>, Vec<_>) = (0..n)
            .map(|i| self.endpoints[(start + i) % n].clone())
            .partition(|e| e.is_usable());
        usable.extend(unusable);
        usable
    }

    fn promote(&self, endpoint: &Endpoint) {
        let previous = self.preferred.swap(endpoint.index, Ordering::Relaxed);
        if previous != endpoint.index {
            tracing::info!(
                from = %self.endpoints[previous].address,
                to = %endpoint.address,
                "Preferred endpoint changed"
            );
        }
    }

    async fn execute<T, F>(&self, op: &'static str, mut call: F) -> Result<(T, Arc<Endpoint>), GatewayError>
    where
        F: FnMut(Arc<dyn KvBackend>) -> BoxFuture<'static, Result<T, StoreError>>,
    {
        let start = Instant::now();
        let order = self.attempt_order();
        let budget = self.config.retry_budget.max(1).min(order.len());
        let mut attempts = 0;

        for endpoint in order.into_iter().take(budget) {
            attempts += 1;
            if endpoint.is_forced_down() {
                endpoint.observe_failure("forced down");
                continue;
            }
            match with_deadline(self.config.rpc_timeout(), call(endpoint.client())).await {
                Ok(value) => {
                    endpoint.observe_success();
                    self.promote(&endpoint);
                    if attempts > 1 {
                        metrics::record_failover(op);
                    }
                    metrics::record_gateway_op(op, "ok", start);
                    return Ok((value, endpoint));
                }
                Err(StoreError::Unreachable(reason)) => {
                    tracing::warn!(
                        op,
                        endpoint = %endpoint.address,
                        attempt = attempts,
                        error = %reason,
                        "Store call failed, trying next endpoint"
                    );
                    endpoint.observe_failure(&reason);
                }
                Err(answer) => {
                    // The endpoint answered; the answer is just not a success.
                    endpoint.observe_success();
                    metrics::record_gateway_op(op, "rejected", start);
                    return Err(answer.into());
                }
            }
        }

        metrics::record_gateway_op(op, "unavailable", start);
        tracing::error!(op, attempts, "No endpoint reachable within retry budget");
        Err(GatewayError::Unavailable { attempts })
    }
}

/// A live watch on one scope, bound to the endpoint that serves it.
///
/// Dropping it closes the stream; the store is not affected.
pub struct ScopeWatch {
    scope: Scope,
    endpoint: Arc<Endpoint>,
    inner: WatchStream,
}

impl std::fmt::Debug for ScopeWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeWatch")
            .field("scope", &self.scope)
            .field("endpoint", &self.endpoint.address)
            .finish()
    }
}

impl ScopeWatch {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Next decoded change. `None` or an error means the stream is over and
    /// must be reopened.
    pub async fn next(&mut self) -> Option<Result<StoreChange, GatewayError>> {
        loop {
            match self.inner.next().await? {
                Ok(event) => match self.decode(event) {
                    Some(change) => return Some(Ok(change)),
                    None => continue,
                },
                Err(StoreError::Unreachable(reason)) => {
                    self.endpoint.observe_failure(&reason);
                    return Some(Err(GatewayError::Unavailable { attempts: 1 }));
                }
                Err(other) => return Some(Err(other.into())),
            }
        }
    }

    fn decode(&self, event: WatchEvent) -> Option<StoreChange> {
        let version = Version::new(event.revision());
        match event.kind {
            ChangeKind::Put => match codec::decode(&event.kv) {
                Ok(entry) => Some(StoreChange {
                    kind: ChangeKind::Put,
                    key: entry.key.clone(),
                    entry: Some(entry),
                    version,
                }),
                Err(e) => {
                    tracing::error!(scope = %self.scope, error = %e, "Skipping unreadable watch event");
                    None
                }
            },
            ChangeKind::Delete => {
                let key = ConfigKey::from_path(&event.kv.key)?;
                Some(StoreChange {
                    kind: ChangeKind::Delete,
                    key: key.key().to_string(),
                    entry: None,
                    version,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::endpoint::HealthState;
    use crate::storage::memory::MemoryCluster;
    use std::time::Duration;

    fn gateway(cluster: &MemoryCluster) -> StorageGateway {
        let config = StorageConfig {
            rpc_timeout_ms: 200,
            retry_budget: cluster.node_count(),
            ..StorageConfig::default()
        };
        StorageGateway::new(cluster.backends(), config)
    }

    fn key(k: &str) -> ConfigKey {
        ConfigKey::parse("svc", "prod", k).unwrap()
    }

    fn meta() -> ConfigMetadata {
        ConfigMetadata::new("tester", "unit")
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let cluster = MemoryCluster::with_nodes(3);
        let gw = gateway(&cluster);

        let v1 = gw.put(&key("a"), 1.into(), meta()).await.unwrap();
        let v2 = gw.put(&key("a"), 2.into(), meta()).await.unwrap();
        assert!(v2 > v1);

        let entry = gw.get(&key("a")).await.unwrap();
        assert_eq!(entry.value, ConfigValue::from(2));
        assert_eq!(entry.version, v2);

        gw.delete(&key("a")).await.unwrap();
        assert!(matches!(gw.get(&key("a")).await, Err(GatewayError::NotFound(_))));
        assert!(matches!(gw.delete(&key("a")).await, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_get_all_is_key_sorted_and_scoped() {
        let cluster = MemoryCluster::with_nodes(1);
        let gw = gateway(&cluster);
        for k in ["zeta", "alpha", "mid"] {
            gw.put(&key(k), k.into(), meta()).await.unwrap();
        }
        let other = ConfigKey::parse("svc", "staging", "alpha").unwrap();
        gw.put(&other, "x".into(), meta()).await.unwrap();

        let scope = Scope::new("svc", "prod").unwrap();
        let keys: Vec<_> = gw.get_all(&scope).await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_fails_over_and_promotes() {
        let cluster = MemoryCluster::with_nodes(3);
        let gw = gateway(&cluster);
        cluster.set_reachable(0, false);

        gw.put(&key("a"), 1.into(), meta()).await.unwrap();
        assert_eq!(gw.endpoints()[0].health(), HealthState::Unhealthy);
        assert_eq!(gw.preferred().unwrap().index, 1);

        // Unhealthy endpoint is tried last, so the next call goes straight to node 1.
        gw.get(&key("a")).await.unwrap();
        assert_eq!(gw.preferred().unwrap().index, 1);
    }

    #[tokio::test]
    async fn test_all_down_is_unavailable_not_not_found() {
        let cluster = MemoryCluster::with_nodes(2);
        let gw = gateway(&cluster);
        cluster.set_reachable(0, false);
        cluster.set_reachable(1, false);
        assert_eq!(
            gw.get(&key("a")).await,
            Err(GatewayError::Unavailable { attempts: 2 })
        );
    }

    #[tokio::test]
    async fn test_retry_budget_caps_attempts() {
        let cluster = MemoryCluster::with_nodes(3);
        let config = StorageConfig {
            retry_budget: 2,
            ..StorageConfig::default()
        };
        let gw = StorageGateway::new(cluster.backends(), config);
        cluster.set_reachable(0, false);
        cluster.set_reachable(1, false);
        assert_eq!(
            gw.get(&key("a")).await,
            Err(GatewayError::Unavailable { attempts: 2 })
        );
        // Both failed endpoints now sort last; node 2 is reached.
        assert!(matches!(gw.get(&key("a")).await, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cluster = MemoryCluster::with_nodes(2);
        let gw = gateway(&cluster);
        cluster.set_latency(0, Duration::from_secs(5));
        gw.put(&key("a"), 1.into(), meta()).await.unwrap();
        assert_eq!(gw.endpoints()[0].health(), HealthState::Unhealthy);
        assert_eq!(gw.preferred().unwrap().index, 1);
    }

    #[tokio::test]
    async fn test_forced_down_endpoint_is_skipped() {
        let cluster = MemoryCluster::with_nodes(2);
        let gw = gateway(&cluster);
        gw.endpoints()[0].set_forced_down(true);
        gw.put(&key("a"), 1.into(), meta()).await.unwrap();
        assert_eq!(gw.preferred().unwrap().index, 1);
    }

    #[tokio::test]
    async fn test_conditional_write_conflict() {
        let cluster = MemoryCluster::with_nodes(1);
        let gw = gateway(&cluster);
        let v1 = gw.put_if(&key("a"), 1.into(), meta(), None).await.unwrap();
        assert_eq!(
            gw.put_if(&key("a"), 2.into(), meta(), None).await,
            Err(GatewayError::Conflict { current: Some(v1) })
        );
        let v2 = gw.put_if(&key("a"), 2.into(), meta(), Some(v1)).await.unwrap();
        assert!(matches!(
            gw.put_if(&key("a"), 3.into(), meta(), Some(v1)).await,
            Err(GatewayError::Conflict { current: Some(v) }) if v == v2
        ));
    }

    #[tokio::test]
    async fn test_invalid_values_never_reach_the_store() {
        let cluster = MemoryCluster::with_nodes(1);
        let config = StorageConfig {
            max_value_bytes: 64,
            ..StorageConfig::default()
        };
        let gw = StorageGateway::new(cluster.backends(), config);

        let big = ConfigValue::String("x".repeat(100));
        assert!(matches!(
            gw.put(&key("a"), big, meta()).await,
            Err(GatewayError::InvalidValue(_))
        ));
        let anonymous = ConfigMetadata::new("", "unit");
        assert!(matches!(
            gw.put(&key("a"), 1.into(), anonymous).await,
            Err(GatewayError::InvalidValue(_))
        ));
        assert_eq!(cluster.revision(), 0);
    }

    #[tokio::test]
    async fn test_watch_decodes_changes_and_resumes() {
        let cluster = MemoryCluster::with_nodes(2);
        let gw = gateway(&cluster);
        let scope = Scope::new("svc", "prod").unwrap();

        let v1 = gw.put(&key("a"), 1.into(), meta()).await.unwrap();
        let mut watch = gw.watch(&scope, None).await.unwrap();
        gw.put(&key("b"), 2.into(), meta()).await.unwrap();
        let dv = gw.delete(&key("a")).await.unwrap();

        let first = watch.next().await.unwrap().unwrap();
        assert_eq!((first.kind, first.key.as_str()), (ChangeKind::Put, "b"));
        let second = watch.next().await.unwrap().unwrap();
        assert_eq!((second.kind, second.version), (ChangeKind::Delete, dv));

        let mut resumed = gw.watch(&scope, Some(v1)).await.unwrap();
        assert_eq!(resumed.next().await.unwrap().unwrap().key, "b");
    }

    #[tokio::test]
    async fn test_broken_watch_marks_endpoint() {
        let cluster = MemoryCluster::with_nodes(2);
        let gw = gateway(&cluster);
        let scope = Scope::new("svc", "prod").unwrap();
        let mut watch = gw.watch(&scope, None).await.unwrap();
        let serving = watch.endpoint().index;

        cluster.set_reachable(serving, false);
        assert!(matches!(
            watch.next().await,
            Some(Err(GatewayError::Unavailable { .. }))
        ));
        assert_eq!(gw.endpoints()[serving].health(), HealthState::Unhealthy);
    }
}
