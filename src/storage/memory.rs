//! In-process replicated backing store.
//!
//! # Responsibilities
//! - Hold one linearizable keyspace shared by N simulated nodes
//! - Stamp every write with a cluster-global revision
//! - Retain a bounded change history so watches can resume from a revision
//! - Let each node be taken down, slowed, or made leader independently
//!
//! # Design Decisions
//! - Replication is modelled as shared state: any reachable node serves the
//!   same data, so failover never observes divergence
//! - A node going down breaks every watch stream it serves
//! - History older than `history_capacity` events is compacted; resuming
//!   before it fails with `Compacted`

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::model::ChangeKind;
use crate::storage::backend::{
    KeyValue, KvBackend, NodeStatus, PutCondition, RangeResult, StoreError, WatchEvent,
    WatchStream,
};

#[derive(Debug)]
struct StoreState {
    data: BTreeMap<String, KeyValue>,
    revision: u64,
    history: VecDeque<WatchEvent>,
    history_capacity: usize,
    /// Highest revision no longer present in `history`.
    compacted: u64,
}

impl StoreState {
    fn record(&mut self, event: WatchEvent, events: &broadcast::Sender<WatchEvent>) {
        self.history.push_back(event.clone());
        while self.history.len() > self.history_capacity {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.revision();
            }
        }
        // No receivers is fine: nobody is watching.
        let _ = events.send(event);
    }
}

#[derive(Debug)]
struct NodeState {
    address: String,
    down: watch::Sender<bool>,
    latency_ms: AtomicU64,
}

impl NodeState {
    fn is_down(&self) -> bool {
        *self.down.borrow()
    }
}

#[derive(Debug)]
struct ClusterInner {
    state: Mutex<StoreState>,
    events: broadcast::Sender<WatchEvent>,
    nodes: Vec<NodeState>,
    leader: AtomicUsize,
}

/// A replicated in-memory store with per-node fault injection.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl MemoryCluster {
    /// Create a cluster with one node per address. Node 0 starts as leader.
    pub fn new(addresses: Vec<String>, history_capacity: usize) -> Self {
        let history_capacity = history_capacity.max(1);
        let (events, _) = broadcast::channel(history_capacity);
        let nodes = addresses
            .into_iter()
            .map(|address| NodeState {
                address,
                down: watch::Sender::new(false),
                latency_ms: AtomicU64::new(0),
            })
            .collect();

        Self {
            inner: Arc::new(ClusterInner {
                state: Mutex::new(StoreState {
                    data: BTreeMap::new(),
                    revision: 0,
                    history: VecDeque::new(),
                    history_capacity,
                    compacted: 0,
                }),
                events,
                nodes,
                leader: AtomicUsize::new(0),
            }),
        }
    }

    /// Cluster of `count` nodes addressed `memory://node-{i}`.
    pub fn with_nodes(count: usize) -> Self {
        let addresses = (0..count).map(|i| format!("memory://node-{}", i)).collect();
        Self::new(addresses, 4096)
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.len()
    }

    pub fn address(&self, index: usize) -> &str {
        &self.inner.nodes[index].address
    }

    /// A client connection to one node.
    pub fn node(&self, index: usize) -> MemoryNode {
        assert!(index < self.inner.nodes.len(), "node index out of range");
        MemoryNode {
            cluster: self.inner.clone(),
            index,
        }
    }

    /// One backend per node, in address order, ready for the gateway.
    pub fn backends(&self) -> Vec<(String, Arc<dyn KvBackend>)> {
        (0..self.node_count())
            .map(|i| {
                let backend: Arc<dyn KvBackend> = Arc::new(self.node(i));
                (self.address(i).to_string(), backend)
            })
            .collect()
    }

    /// Take a node down (breaking its watches) or bring it back.
    pub fn set_reachable(&self, index: usize, reachable: bool) {
        let node = &self.inner.nodes[index];
        node.down.send_replace(!reachable);
        tracing::debug!(node = %node.address, reachable, "memory node reachability changed");
    }

    /// Delay every request served by a node.
    pub fn set_latency(&self, index: usize, latency: Duration) {
        self.inner.nodes[index]
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_leader(&self, index: usize) {
        self.inner.leader.store(index, Ordering::Relaxed);
    }

    /// Current store revision.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Drop all retained history; any watch resuming at or before the current
    /// revision now fails with `Compacted`.
    pub fn compact(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.compacted = state.revision;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.inner.state.lock().expect("memory store mutex poisoned")
    }
}

/// Client connection to one node of a [`MemoryCluster`].
#[derive(Debug, Clone)]
pub struct MemoryNode {
    cluster: Arc<ClusterInner>,
    index: usize,
}

impl MemoryNode {
    fn state(&self) -> &NodeState {
        &self.cluster.nodes[self.index]
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.cluster.state.lock().expect("memory store mutex poisoned")
    }

    /// Simulated network hop: latency first, then reachability.
    async fn enter(&self) -> Result<(), StoreError> {
        let latency = self.state().latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.state().is_down() {
            return Err(StoreError::Unreachable(format!(
                "{} is down",
                self.state().address
            )));
        }
        Ok(())
    }

    fn apply_put(&self, key: &str, value: Vec<u8>, condition: PutCondition) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let existing = state.data.get(key).map(|kv| (kv.create_revision, kv.mod_revision));
        let current = existing.map(|(_, m)| m);
        let satisfied = match condition {
            PutCondition::Always => true,
            PutCondition::Absent => current.is_none(),
            PutCondition::Revision(expected) => current == Some(expected),
        };
        if !satisfied {
            return Err(StoreError::Conflict { current });
        }

        state.revision += 1;
        let revision = state.revision;
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: existing.map(|(c, _)| c).unwrap_or(revision),
            mod_revision: revision,
        };
        state.data.insert(key.to_string(), kv.clone());
        state.record(
            WatchEvent {
                kind: ChangeKind::Put,
                kv,
            },
            &self.cluster.events,
        );
        Ok(revision)
    }

    fn apply_delete(&self, key: &str) -> Option<u64> {
        let mut state = self.lock();
        let removed = state.data.remove(key)?;
        state.revision += 1;
        let revision = state.revision;
        state.record(
            WatchEvent {
                kind: ChangeKind::Delete,
                kv: KeyValue {
                    key: key.to_string(),
                    value: Vec::new(),
                    create_revision: removed.create_revision,
                    mod_revision: revision,
                },
            },
            &self.cluster.events,
        );
        Some(revision)
    }

    fn open_watch(&self, prefix: &str, start_revision: Option<u64>) -> Result<WatchStream, StoreError> {
        // Subscribe under the lock so nothing falls between backlog and live tail.
        let state = self.lock();
        let rx = self.cluster.events.subscribe();
        let next_revision = start_revision.unwrap_or(state.revision + 1);
        if next_revision <= state.compacted {
            return Err(StoreError::Compacted {
                requested: next_revision,
                compacted: state.compacted,
            });
        }
        let backlog: VecDeque<WatchEvent> = state
            .history
            .iter()
            .filter(|e| e.revision() >= next_revision && e.kv.key.starts_with(prefix))
            .cloned()
            .collect();
        drop(state);

        let cursor = WatchCursor {
            backlog,
            rx,
            down: self.state().down.subscribe(),
            address: self.state().address.clone(),
            prefix: prefix.to_string(),
            next_revision,
            finished: false,
        };
        Ok(stream::unfold(cursor, WatchCursor::advance).boxed())
    }
}

struct WatchCursor {
    backlog: VecDeque<WatchEvent>,
    rx: broadcast::Receiver<WatchEvent>,
    down: watch::Receiver<bool>,
    address: String,
    prefix: String,
    next_revision: u64,
    finished: bool,
}

impl WatchCursor {
    async fn advance(mut self) -> Option<(Result<WatchEvent, StoreError>, Self)> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.backlog.pop_front() {
            self.next_revision = event.revision() + 1;
            return Some((Ok(event), self));
        }
        loop {
            tokio::select! {
                changed = self.down.changed() => {
                    if changed.is_err() || *self.down.borrow() {
                        self.finished = true;
                        let err = StoreError::Unreachable(format!("{} went down", self.address));
                        return Some((Err(err), self));
                    }
                }
                received = self.rx.recv() => match received {
                    Ok(event) => {
                        if event.revision() < self.next_revision || !event.kv.key.starts_with(&self.prefix) {
                            continue;
                        }
                        self.next_revision = event.revision() + 1;
                        return Some((Ok(event), self));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.finished = true;
                        let err = StoreError::Unreachable(format!("watch lagged by {} events", skipped));
                        return Some((Err(err), self));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    }
}

impl KvBackend for MemoryNode {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<KeyValue>, StoreError>> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.lock().data.get(key).cloned())
        })
    }

    fn range<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<RangeResult, StoreError>> {
        Box::pin(async move {
            self.enter().await?;
            let state = self.lock();
            let kvs = state
                .data
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(_, kv)| kv.clone())
                .collect();
            Ok(RangeResult {
                kvs,
                revision: state.revision,
            })
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        condition: PutCondition,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            self.enter().await?;
            self.apply_put(key, value, condition)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<u64>, StoreError>> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.apply_delete(key))
        })
    }

    fn watch<'a>(
        &'a self,
        prefix: &'a str,
        start_revision: Option<u64>,
    ) -> BoxFuture<'a, Result<WatchStream, StoreError>> {
        Box::pin(async move {
            self.enter().await?;
            self.open_watch(prefix, start_revision)
        })
    }

    fn status(&self) -> BoxFuture<'_, Result<NodeStatus, StoreError>> {
        Box::pin(async move {
            self.enter().await?;
            Ok(NodeStatus {
                is_leader: self.cluster.leader.load(Ordering::Relaxed) == self.index,
                revision: self.lock().revision,
            })
        })
    }
}
