//! Watch consumption and event emission for one scope.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::FeedConfig;
use crate::feed::error::FeedError;
use crate::feed::resync::{self, ResyncChange};
use crate::model::{ChangeEvent, ChangeKind, ConfigEntry, Scope, Version};
use crate::observability::metrics;
use crate::resilience::backoff::Backoff;
use crate::storage::{GatewayError, ScopeWatch, StorageGateway, StoreChange};

/// Factory for per-scope change streams.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    gateway: Arc<StorageGateway>,
    config: FeedConfig,
}

impl ChangeFeed {
    pub fn new(gateway: Arc<StorageGateway>, config: FeedConfig) -> Self {
        Self { gateway, config }
    }

    pub fn gateway(&self) -> &Arc<StorageGateway> {
        &self.gateway
    }

    /// Open a change stream for `scope`.
    ///
    /// Without `resume_from` the stream starts after a silent baseline read
    /// and yields every change made after it. With `resume_from` it replays
    /// every change after that version; if the store no longer retains that
    /// history the call fails with `Compacted` and the caller must subscribe
    /// afresh and reconcile.
    pub async fn subscribe(&self, scope: Scope, resume_from: Option<Version>) -> Result<ChangeStream, FeedError> {
        let (worker, first_watch) = match resume_from {
            None => {
                let baseline = self.gateway.snapshot(&scope).await?;
                let watch = match self.gateway.watch(&scope, Some(baseline.revision)).await {
                    Ok(watch) => Some(watch),
                    Err(e) => {
                        tracing::warn!(scope = %scope, error = %e, "Initial watch failed, worker will retry");
                        None
                    }
                };
                let worker = FeedWorker::new(
                    self.gateway.clone(),
                    self.config.clone(),
                    scope,
                    Some(resync::versions(&baseline)),
                    baseline.revision.revision(),
                );
                (worker, watch)
            }
            Some(version) => {
                let watch = self.gateway.watch(&scope, Some(version)).await?;
                let worker = FeedWorker::new(
                    self.gateway.clone(),
                    self.config.clone(),
                    scope,
                    None,
                    version.revision(),
                );
                (worker, Some(watch))
            }
        };

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        tracing::debug!(scope = %worker.scope, "Change stream opened");
        let task = tokio::spawn(worker.run(first_watch, tx));
        Ok(ChangeStream { rx, task })
    }
}

/// Ordered, gap-resilient change events of one scope.
///
/// At-least-once: after a resync, events for unchanged-but-reemitted keys may
/// repeat. Dropping the stream stops its worker and closes the watch.
#[derive(Debug)]
pub struct ChangeStream {
    rx: mpsc::Receiver<Result<ChangeEvent, FeedError>>,
    task: JoinHandle<()>,
}

impl ChangeStream {
    /// Next event. An `Err` is terminal; `None` means the worker is gone.
    pub async fn recv(&mut self) -> Option<Result<ChangeEvent, FeedError>> {
        self.rx.recv().await
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Outcome {
    /// Consumer dropped the stream.
    Closed,
    /// Watch ended or broke; resume from the last revision.
    Broken { delivered: bool },
    Failed(GatewayError),
}

struct FeedWorker {
    gateway: Arc<StorageGateway>,
    config: FeedConfig,
    scope: Scope,
    /// Last emitted version per key. `None` while the consumer's starting
    /// state is not known to the worker (resumed streams).
    known: Option<HashMap<String, Version>>,
    last_revision: u64,
    seq: u64,
}

impl FeedWorker {
    fn new(
        gateway: Arc<StorageGateway>,
        config: FeedConfig,
        scope: Scope,
        known: Option<HashMap<String, Version>>,
        last_revision: u64,
    ) -> Self {
        Self {
            gateway,
            config,
            scope,
            known,
            last_revision,
            seq: 0,
        }
    }

    async fn run(mut self, first_watch: Option<ScopeWatch>, tx: mpsc::Sender<Result<ChangeEvent, FeedError>>) {
        let mut backoff = Backoff::new(self.config.retry_base_ms, self.config.retry_max_ms);
        let mut pending = first_watch;

        loop {
            let outcome = match pending.take() {
                Some(watch) => self.consume(watch, &tx, &mut backoff).await,
                None => match self
                    .gateway
                    .watch(&self.scope, Some(Version::new(self.last_revision)))
                    .await
                {
                    Ok(watch) => self.consume(watch, &tx, &mut backoff).await,
                    Err(e) => Outcome::Failed(e),
                },
            };

            let failure = match outcome {
                Outcome::Closed => return,
                Outcome::Broken { delivered } => {
                    tracing::warn!(scope = %self.scope, revision = self.last_revision, "Watch stream broke, resuming");
                    if !delivered {
                        // Reopened watches that die at once must not spin.
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                    continue;
                }
                Outcome::Failed(GatewayError::Compacted { .. }) if self.known.is_some() => {
                    match self.resync(&tx).await {
                        Ok(true) => {
                            backoff.reset();
                            continue;
                        }
                        Ok(false) => return,
                        Err(e) => e,
                    }
                }
                Outcome::Failed(e @ GatewayError::Compacted { .. }) => {
                    tracing::warn!(scope = %self.scope, error = %e, "Resumed stream cannot continue past compaction");
                    let _ = tx.send(Err(FeedError::Gateway(e))).await;
                    return;
                }
                Outcome::Failed(e) => e,
            };

            let delay = backoff.next_delay();
            let attempts = backoff.attempts();
            if attempts > self.config.resync_retry_budget {
                tracing::error!(scope = %self.scope, attempts, error = %failure, "Giving up on change stream");
                metrics::record_resync("exhausted");
                let _ = tx.send(Err(FeedError::ResyncExhausted { attempts: attempts - 1 })).await;
                return;
            }
            tracing::warn!(
                scope = %self.scope,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Change stream reconnect failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn consume(
        &mut self,
        mut watch: ScopeWatch,
        tx: &mpsc::Sender<Result<ChangeEvent, FeedError>>,
        backoff: &mut Backoff,
    ) -> Outcome {
        let mut delivered = false;
        loop {
            match watch.next().await {
                Some(Ok(change)) => {
                    if !self.apply(change, tx).await {
                        return Outcome::Closed;
                    }
                    delivered = true;
                    backoff.reset();
                }
                Some(Err(e @ GatewayError::Compacted { .. })) => return Outcome::Failed(e),
                Some(Err(_)) | None => return Outcome::Broken { delivered },
            }
        }
    }

    async fn apply(&mut self, change: StoreChange, tx: &mpsc::Sender<Result<ChangeEvent, FeedError>>) -> bool {
        self.last_revision = self.last_revision.max(change.version.revision());
        match (change.kind, change.entry) {
            (ChangeKind::Put, Some(entry)) => self.emit_put(entry, tx).await,
            _ => self.emit_delete(change.key, change.version, tx).await,
        }
    }

    async fn emit_put(&mut self, entry: ConfigEntry, tx: &mpsc::Sender<Result<ChangeEvent, FeedError>>) -> bool {
        if let Some(known) = self.known.as_mut() {
            if known.get(&entry.key).is_some_and(|v| *v >= entry.version) {
                return true;
            }
            known.insert(entry.key.clone(), entry.version);
        }
        self.seq += 1;
        metrics::record_feed_event("put");
        tx.send(Ok(ChangeEvent::put(self.scope.clone(), entry, self.seq))).await.is_ok()
    }

    async fn emit_delete(
        &mut self,
        key: String,
        version: Version,
        tx: &mpsc::Sender<Result<ChangeEvent, FeedError>>,
    ) -> bool {
        if let Some(known) = self.known.as_mut() {
            known.remove(&key);
        }
        self.seq += 1;
        metrics::record_feed_event("delete");
        tx.send(Ok(ChangeEvent::delete(self.scope.clone(), key, version, self.seq)))
            .await
            .is_ok()
    }

    /// Re-read the scope and emit the difference from what was already
    /// emitted. Returns false if the consumer went away.
    async fn resync(&mut self, tx: &mpsc::Sender<Result<ChangeEvent, FeedError>>) -> Result<bool, GatewayError> {
        let snapshot = match self.gateway.snapshot(&self.scope).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                metrics::record_resync("failed");
                return Err(e);
            }
        };
        let known = self.known.take().unwrap_or_default();
        let changes = resync::diff(&known, &snapshot);
        tracing::info!(
            scope = %self.scope,
            from_revision = self.last_revision,
            to_revision = snapshot.revision.revision(),
            changes = changes.len(),
            "Resyncing scope after compaction"
        );

        self.known = Some(resync::versions(&snapshot));
        self.last_revision = snapshot.revision.revision();
        metrics::record_resync("ok");

        for change in changes {
            let delivered = match change {
                ResyncChange::Put(entry) => {
                    self.seq += 1;
                    metrics::record_feed_event("put");
                    tx.send(Ok(ChangeEvent::put(self.scope.clone(), entry, self.seq))).await.is_ok()
                }
                ResyncChange::Delete { key, version } => {
                    self.seq += 1;
                    metrics::record_feed_event("delete");
                    tx.send(Ok(ChangeEvent::delete(self.scope.clone(), key, version, self.seq)))
                        .await
                        .is_ok()
                }
            };
            if !delivered {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::model::{ConfigKey, ConfigMetadata, ConfigValue};
    use crate::storage::backend::{KeyValue, NodeStatus, PutCondition, RangeResult, StoreError, WatchEvent, WatchStream};
    use crate::storage::{KvBackend, MemoryCluster};
    use futures_util::future::BoxFuture;
    use futures_util::{FutureExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Serves reads from a real node but every watch ends before any event.
    struct FlappingWatch {
        inner: Arc<dyn KvBackend>,
        opened: Arc<AtomicUsize>,
    }

    impl KvBackend for FlappingWatch {
        fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<KeyValue>, StoreError>> {
            self.inner.get(key)
        }

        fn range<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<RangeResult, StoreError>> {
            self.inner.range(prefix)
        }

        fn put<'a>(
            &'a self,
            key: &'a str,
            value: Vec<u8>,
            condition: PutCondition,
        ) -> BoxFuture<'a, Result<u64, StoreError>> {
            self.inner.put(key, value, condition)
        }

        fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<u64>, StoreError>> {
            self.inner.delete(key)
        }

        fn watch<'a>(
            &'a self,
            _prefix: &'a str,
            _start_revision: Option<u64>,
        ) -> BoxFuture<'a, Result<WatchStream, StoreError>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            async { Ok(futures_util::stream::empty::<Result<WatchEvent, StoreError>>().boxed()) }.boxed()
        }

        fn status(&self) -> BoxFuture<'_, Result<NodeStatus, StoreError>> {
            self.inner.status()
        }
    }

    fn setup(nodes: usize) -> (MemoryCluster, Arc<StorageGateway>, ChangeFeed) {
        let cluster = MemoryCluster::with_nodes(nodes);
        let gateway = Arc::new(StorageGateway::new(
            cluster.backends(),
            StorageConfig {
                rpc_timeout_ms: 200,
                ..StorageConfig::default()
            },
        ));
        let feed = ChangeFeed::new(
            gateway.clone(),
            FeedConfig {
                retry_base_ms: 10,
                retry_max_ms: 50,
                resync_retry_budget: 5,
                ..FeedConfig::default()
            },
        );
        (cluster, gateway, feed)
    }

    fn scope() -> Scope {
        Scope::new("svc", "prod").unwrap()
    }

    fn key(k: &str) -> ConfigKey {
        ConfigKey::parse("svc", "prod", k).unwrap()
    }

    async fn put(gw: &StorageGateway, k: &str, v: i64) -> Version {
        gw.put(&key(k), ConfigValue::from(v), ConfigMetadata::new("t", "unit")).await.unwrap()
    }

    async fn next(stream: &mut ChangeStream) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("event within deadline")
            .expect("stream open")
            .expect("no feed error")
    }

    #[tokio::test]
    async fn test_emits_changes_after_baseline_with_increasing_seq() {
        let (_cluster, gw, feed) = setup(1);
        put(&gw, "before", 1).await;
        let mut stream = feed.subscribe(scope(), None).await.unwrap();

        put(&gw, "a", 1).await;
        gw.delete(&key("a")).await.unwrap();

        let first = next(&mut stream).await;
        assert_eq!((first.kind, first.key.as_str(), first.seq), (ChangeKind::Put, "a", 1));
        let second = next(&mut stream).await;
        assert_eq!((second.kind, second.seq), (ChangeKind::Delete, 2));
    }

    #[tokio::test]
    async fn test_resumes_on_another_endpoint_without_gap() {
        let (cluster, gw, feed) = setup(2);
        let mut stream = feed.subscribe(scope(), None).await.unwrap();
        put(&gw, "a", 1).await;
        assert_eq!(next(&mut stream).await.key, "a");

        cluster.set_reachable(0, false);
        put(&gw, "b", 2).await;
        put(&gw, "c", 3).await;

        let keys = [next(&mut stream).await.key, next(&mut stream).await.key];
        assert_eq!(keys, ["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_resync_after_compaction_synthesizes_diff() {
        // The feed only reaches node 0; writes during the outage go through node 1.
        let cluster = MemoryCluster::with_nodes(2);
        let mut backends = cluster.backends();
        let writer_backend = backends.split_off(1);
        let feed_gw = Arc::new(StorageGateway::new(backends, StorageConfig::default()));
        let writer = StorageGateway::new(writer_backend, StorageConfig::default());
        let feed = ChangeFeed::new(
            feed_gw,
            FeedConfig {
                retry_base_ms: 10,
                retry_max_ms: 50,
                ..FeedConfig::default()
            },
        );

        put(&writer, "keep", 1).await;
        put(&writer, "drop", 1).await;
        let mut stream = feed.subscribe(scope(), None).await.unwrap();

        cluster.set_reachable(0, false);
        let changed = put(&writer, "keep", 2).await;
        writer.delete(&key("drop")).await.unwrap();
        put(&writer, "new", 3).await;
        cluster.compact();
        let revision = cluster.revision();
        cluster.set_reachable(0, true);

        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(next(&mut stream).await);
        }
        let summary: Vec<_> = events.iter().map(|e| (e.kind, e.key.as_str(), e.version)).collect();
        assert!(summary.contains(&(ChangeKind::Put, "keep", changed)));
        assert!(summary.iter().any(|(k, key, _)| *k == ChangeKind::Put && *key == "new"));
        assert!(summary.contains(&(ChangeKind::Delete, "drop", Version::new(revision))));
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn test_resume_from_version_replays() {
        let (_cluster, gw, feed) = setup(1);
        let v1 = put(&gw, "a", 1).await;
        put(&gw, "b", 2).await;
        let mut stream = feed.subscribe(scope(), Some(v1)).await.unwrap();
        assert_eq!(next(&mut stream).await.key, "b");
    }

    #[tokio::test]
    async fn test_resume_past_compaction_is_refused() {
        let (cluster, gw, feed) = setup(1);
        let v1 = put(&gw, "a", 1).await;
        put(&gw, "b", 2).await;
        cluster.compact();
        assert!(matches!(
            feed.subscribe(scope(), Some(v1)).await,
            Err(FeedError::Gateway(GatewayError::Compacted { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_ends_stream_with_error() {
        let (cluster, _gw, feed) = setup(1);
        let mut stream = feed.subscribe(scope(), None).await.unwrap();
        cluster.set_reachable(0, false);

        let result = stream.recv().await.unwrap();
        assert_eq!(result, Err(FeedError::ResyncExhausted { attempts: 5 }));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_that_dies_at_once_is_reopened_with_backoff() {
        let cluster = MemoryCluster::with_nodes(1);
        let opened = Arc::new(AtomicUsize::new(0));
        let (address, inner) = cluster.backends().remove(0);
        let backend: Arc<dyn KvBackend> = Arc::new(FlappingWatch {
            inner,
            opened: opened.clone(),
        });
        let gateway = Arc::new(StorageGateway::new(vec![(address, backend)], StorageConfig::default()));
        let feed = ChangeFeed::new(
            gateway,
            FeedConfig {
                retry_base_ms: 10,
                retry_max_ms: 50,
                ..FeedConfig::default()
            },
        );

        let _stream = feed.subscribe(scope(), None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // At least 45ms apart once capped, so roughly twenty reopens a second.
        let count = opened.load(Ordering::SeqCst);
        assert!(count >= 5, "watch reopened only {count} times");
        assert!(count <= 40, "watch reopened {count} times in one second");
    }
}
