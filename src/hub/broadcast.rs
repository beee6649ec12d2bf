//! Scope-partitioned fan-out.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::feed::{ChangeFeed, ChangeStream};
use crate::hub::error::{DisconnectReason, HubError};
use crate::hub::subscription::{SubscriberSlot, SubscriberState, Subscription};
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::model::{ChangeEvent, Scope};
use crate::observability::metrics;

#[derive(Debug, Default)]
struct Registry {
    slots: HashMap<Uuid, Arc<SubscriberSlot>>,
    /// True while a pump task feeds this scope.
    pump_alive: bool,
    /// Bumped on every attach and detach; a pump only detaches its own
    /// generation.
    generation: u64,
    pump: Option<JoinHandle<()>>,
}

/// Subscribers of one scope plus the pump feeding them.
#[derive(Debug)]
pub(crate) struct ScopeChannel {
    scope: Scope,
    /// Read by publishers without locking.
    subscribers: ArcSwap<Vec<Arc<SubscriberSlot>>>,
    registry: Mutex<Registry>,
    starting: tokio::sync::Mutex<()>,
}

impl ScopeChannel {
    fn new(scope: Scope) -> Self {
        Self {
            scope,
            subscribers: ArcSwap::from_pointee(Vec::new()),
            registry: Mutex::new(Registry::default()),
            starting: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().expect("hub registry mutex poisoned")
    }

    fn refresh(&self, registry: &Registry) {
        let snapshot: Vec<_> = registry.slots.values().cloned().collect();
        metrics::record_subscribers(&self.scope.to_string(), snapshot.len());
        self.subscribers.store(Arc::new(snapshot));
    }

    /// Refused once the pump has died, so nobody joins a scope that no
    /// longer receives events.
    fn register(&self, slot: Arc<SubscriberSlot>) -> bool {
        let mut registry = self.lock();
        if !registry.pump_alive {
            return false;
        }
        registry.slots.insert(slot.id, slot);
        self.refresh(&registry);
        true
    }

    pub(crate) fn remove(&self, id: Uuid, reason: DisconnectReason) {
        let mut registry = self.lock();
        let Some(slot) = registry.slots.remove(&id) else {
            return;
        };
        slot.state.close(reason);
        self.refresh(&registry);
        drop(registry);

        match reason {
            DisconnectReason::Unsubscribed | DisconnectReason::Closed => {
                tracing::debug!(scope = %self.scope, subscriber = %id, %reason, "Subscriber left");
            }
            _ => {
                tracing::warn!(scope = %self.scope, subscriber = %id, %reason, "Subscriber disconnected");
                metrics::record_disconnect(reason.as_str());
            }
        }
    }

    /// Keep the task of pump `generation`. Aborts it and returns false when
    /// the scope was detached while it started.
    fn attach(&self, generation: u64, task: JoinHandle<()>) -> bool {
        let mut registry = self.lock();
        if !registry.pump_alive || registry.generation != generation {
            task.abort();
            return false;
        }
        if let Some(previous) = registry.pump.replace(task) {
            previous.abort();
        }
        true
    }

    /// Disconnect everyone and stop the pump, in one step under the registry
    /// lock. With `only`, a pump that is no longer current leaves the scope
    /// alone.
    fn fail_all(&self, reason: DisconnectReason, only: Option<u64>) -> usize {
        let mut registry = self.lock();
        if only.is_some_and(|generation| generation != registry.generation) {
            return 0;
        }
        registry.pump_alive = false;
        registry.generation += 1;
        if let Some(task) = registry.pump.take() {
            // A pump detaching itself is already on its way out.
            if only.is_none() {
                task.abort();
            }
        }
        let slots: Vec<_> = registry.slots.drain().map(|(_, slot)| slot).collect();
        self.refresh(&registry);
        drop(registry);

        for slot in &slots {
            slot.state.close(reason);
            metrics::record_disconnect(reason.as_str());
        }
        slots.len()
    }

    fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Non-blocking fan-out: a full queue costs its owner the subscription,
    /// never anyone else a delay.
    fn publish(&self, event: Arc<ChangeEvent>) -> usize {
        let subscribers = self.subscribers.load();
        let mut delivered = 0;
        let mut evicted = Vec::new();
        for slot in subscribers.iter() {
            match slot.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => evicted.push((slot.id, DisconnectReason::Backpressure)),
                Err(TrySendError::Closed(_)) => evicted.push((slot.id, DisconnectReason::Closed)),
            }
        }
        metrics::record_deliveries(delivered);
        for (id, reason) in evicted {
            self.remove(id, reason);
        }
        delivered
    }

    fn expired(&self, now: Instant, timeout: Duration) -> Vec<Uuid> {
        self.lock()
            .slots
            .values()
            .filter(|slot| now.saturating_duration_since(slot.state.last_heartbeat()) > timeout)
            .map(|slot| slot.id)
            .collect()
    }
}

#[derive(Debug)]
struct HubInner {
    feed: ChangeFeed,
    config: HubConfig,
    scopes: DashMap<Scope, Arc<ScopeChannel>>,
    closed: AtomicBool,
}

/// Fan-out of change events to live subscribers, partitioned by scope.
///
/// Publishing touches only the subscribers of the event's scope. Cloning is
/// cheap and every clone is the same hub.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(feed: ChangeFeed, config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                feed,
                config,
                scopes: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to a scope, starting its change feed if nobody else is
    /// listening yet. The returned subscription receives every event the
    /// feed emits after registration.
    pub async fn subscribe(&self, scope: &Scope) -> Result<Subscription, HubError> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(HubError::ShutDown);
            }

            let channel = self
                .inner
                .scopes
                .entry(scope.clone())
                .or_insert_with(|| Arc::new(ScopeChannel::new(scope.clone())))
                .clone();
            self.ensure_pump(&channel).await?;

            let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
            let state = Arc::new(SubscriberState::new());
            let id = Uuid::new_v4();
            let slot = Arc::new(SubscriberSlot {
                id,
                tx,
                state: state.clone(),
            });
            if !channel.register(slot) {
                continue;
            }

            // The reaper may have retired this channel between lookup and registration.
            let current = self.inner.scopes.get(scope).map(|c| Arc::ptr_eq(c.value(), &channel));
            if current != Some(true) {
                channel.remove(id, DisconnectReason::Closed);
                continue;
            }

            tracing::debug!(scope = %scope, subscriber = %id, "Subscriber registered");
            return Ok(Subscription::new(id, scope.clone(), rx, state, channel));
        }
    }

    async fn ensure_pump(&self, channel: &Arc<ScopeChannel>) -> Result<(), HubError> {
        let _starting = channel.starting.lock().await;
        if channel.lock().pump_alive {
            return Ok(());
        }

        let stream = self.inner.feed.subscribe(channel.scope.clone(), None).await?;
        let generation = {
            let mut registry = channel.lock();
            registry.pump_alive = true;
            registry.generation += 1;
            registry.generation
        };
        let task = tokio::spawn(pump(channel.clone(), stream, generation));
        if !channel.attach(generation, task) {
            tracing::debug!(scope = %channel.scope, "Scope detached while its feed was starting");
            return Ok(());
        }
        tracing::info!(scope = %channel.scope, "Change feed attached to scope");
        Ok(())
    }

    /// Deliver an event to every subscriber of its scope. Returns how many
    /// subscribers accepted it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        match self.inner.scopes.get(&event.scope).map(|c| c.value().clone()) {
            Some(channel) => channel.publish(Arc::new(event)),
            None => 0,
        }
    }

    /// Force every subscriber of a scope off with `reason`.
    pub fn disconnect_scope(&self, scope: &Scope, reason: DisconnectReason) -> usize {
        match self.inner.scopes.get(scope).map(|c| c.value().clone()) {
            Some(channel) => channel.fail_all(reason, None),
            None => 0,
        }
    }

    pub fn subscriber_count(&self, scope: &Scope) -> usize {
        self.inner.scopes.get(scope).map(|c| c.len()).unwrap_or(0)
    }

    /// Scopes that currently have a channel.
    pub fn scope_count(&self) -> usize {
        self.inner.scopes.len()
    }

    /// Disconnect silent subscribers and retire empty scopes.
    pub fn reap(&self) {
        let now = Instant::now();
        let timeout = self.inner.config.heartbeat_timeout();
        let channels: Vec<_> = self.inner.scopes.iter().map(|c| c.value().clone()).collect();

        for channel in channels {
            for id in channel.expired(now, timeout) {
                channel.remove(id, DisconnectReason::HeartbeatTimeout);
            }
            let retired = self
                .inner
                .scopes
                .remove_if(&channel.scope, |_, c| Arc::ptr_eq(c, &channel) && c.len() == 0);
            if retired.is_some() {
                channel.fail_all(DisconnectReason::Closed, None);
                tracing::debug!(scope = %channel.scope, "Retired idle scope");
            }
        }
    }

    /// Periodic heartbeat reaping until shutdown, then disconnect everyone.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = time::interval(self.inner.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reap(),
                _ = shutdown.wait() => {
                    tracing::info!("Broadcast hub received shutdown signal");
                    break;
                }
            }
        }
        self.close();
    }

    /// Refuse new subscriptions and disconnect every subscriber.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let channels: Vec<_> = self.inner.scopes.iter().map(|c| c.value().clone()).collect();
        self.inner.scopes.clear();
        for channel in channels {
            channel.fail_all(DisconnectReason::Shutdown, None);
        }
    }
}

/// Moves events from a scope's change stream into its subscribers' queues.
async fn pump(channel: Arc<ScopeChannel>, mut stream: ChangeStream, generation: u64) {
    loop {
        match stream.recv().await {
            Some(Ok(event)) => {
                channel.publish(Arc::new(event));
            }
            Some(Err(e)) => {
                tracing::error!(scope = %channel.scope, error = %e, "Change feed failed, subscribers must resync");
                break;
            }
            None => {
                tracing::warn!(scope = %channel.scope, "Change feed ended, subscribers must resync");
                break;
            }
        }
    }
    let dropped = channel.fail_all(DisconnectReason::ResyncRequired, Some(generation));
    tracing::info!(scope = %channel.scope, subscribers = dropped, "Scope detached from change feed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeedConfig, StorageConfig};
    use crate::model::{ConfigKey, ConfigMetadata, ConfigValue};
    use crate::storage::{MemoryCluster, StorageGateway};

    fn hub_with(cluster: &MemoryCluster, config: HubConfig) -> (BroadcastHub, Arc<StorageGateway>) {
        let gateway = Arc::new(StorageGateway::new(cluster.backends(), StorageConfig::default()));
        let feed = ChangeFeed::new(gateway.clone(), FeedConfig::default());
        (BroadcastHub::new(feed, config), gateway)
    }

    fn scope(env: &str) -> Scope {
        Scope::new("svc", env).unwrap()
    }

    fn event(env: &str, key: &str, seq: u64) -> ChangeEvent {
        let key = ConfigKey::parse("svc", env, key).unwrap();
        let entry = crate::model::ConfigEntry::new(
            &key,
            ConfigValue::from(seq as i64),
            crate::model::Version::new(seq),
            ConfigMetadata::new("t", "unit"),
        );
        ChangeEvent::put(scope(env), entry, seq)
    }

    #[tokio::test]
    async fn test_feed_events_reach_subscribers() {
        let cluster = MemoryCluster::with_nodes(1);
        let (hub, gateway) = hub_with(&cluster, HubConfig::default());
        let mut sub = hub.subscribe(&scope("prod")).await.unwrap();

        let key = ConfigKey::parse("svc", "prod", "a").unwrap();
        gateway.put(&key, 1.into(), ConfigMetadata::new("t", "unit")).await.unwrap();

        let event = time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.key, "a");
    }

    #[tokio::test]
    async fn test_publish_is_scoped() {
        let cluster = MemoryCluster::with_nodes(1);
        let (hub, _) = hub_with(&cluster, HubConfig::default());
        let _prod = hub.subscribe(&scope("prod")).await.unwrap();
        let _staging = hub.subscribe(&scope("staging")).await.unwrap();

        assert_eq!(hub.publish(event("prod", "a", 1)), 1);
        assert_eq!(hub.publish(event("dev", "a", 1)), 0);
    }

    #[tokio::test]
    async fn test_full_queue_disconnects_only_that_subscriber() {
        let cluster = MemoryCluster::with_nodes(1);
        let config = HubConfig {
            queue_capacity: 2,
            ..HubConfig::default()
        };
        let (hub, _) = hub_with(&cluster, config);
        let mut slow = hub.subscribe(&scope("prod")).await.unwrap();
        let mut fast = hub.subscribe(&scope("prod")).await.unwrap();

        for seq in 1..=3 {
            hub.publish(event("prod", "a", seq));
            assert_eq!(fast.recv().await.unwrap().seq, seq);
        }

        assert_eq!(slow.recv().await, Err(DisconnectReason::Backpressure));
        assert_eq!(hub.subscriber_count(&scope("prod")), 1);
        hub.publish(event("prod", "a", 4));
        assert_eq!(fast.recv().await.unwrap().seq, 4);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop_release_slot() {
        let cluster = MemoryCluster::with_nodes(1);
        let (hub, _) = hub_with(&cluster, HubConfig::default());
        let a = hub.subscribe(&scope("prod")).await.unwrap();
        let b = hub.subscribe(&scope("prod")).await.unwrap();
        assert_eq!(hub.subscriber_count(&scope("prod")), 2);

        a.unsubscribe();
        drop(b);
        assert_eq!(hub.subscriber_count(&scope("prod")), 0);
        assert_eq!(hub.publish(event("prod", "a", 1)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_subscriber_is_reaped() {
        let cluster = MemoryCluster::with_nodes(1);
        let (hub, _) = hub_with(&cluster, HubConfig::default());
        let mut silent = hub.subscribe(&scope("prod")).await.unwrap();
        let alive = hub.subscribe(&scope("prod")).await.unwrap();

        time::advance(Duration::from_secs(20)).await;
        alive.heartbeat();
        time::advance(Duration::from_secs(15)).await;
        hub.reap();

        assert_eq!(silent.recv().await, Err(DisconnectReason::HeartbeatTimeout));
        assert_eq!(alive.disconnect_reason(), None);
        assert_eq!(hub.subscriber_count(&scope("prod")), 1);
    }

    #[tokio::test]
    async fn test_idle_scope_is_retired_and_restarts() {
        let cluster = MemoryCluster::with_nodes(1);
        let (hub, _) = hub_with(&cluster, HubConfig::default());
        drop(hub.subscribe(&scope("prod")).await.unwrap());
        hub.reap();
        assert_eq!(hub.scope_count(), 0);

        let _again = hub.subscribe(&scope("prod")).await.unwrap();
        assert_eq!(hub.subscriber_count(&scope("prod")), 1);
    }

    #[tokio::test]
    async fn test_disconnect_scope_requires_resync() {
        let cluster = MemoryCluster::with_nodes(1);
        let (hub, _) = hub_with(&cluster, HubConfig::default());
        let mut sub = hub.subscribe(&scope("prod")).await.unwrap();
        assert_eq!(hub.disconnect_scope(&scope("prod"), DisconnectReason::ResyncRequired), 1);
        assert_eq!(sub.recv().await, Err(DisconnectReason::ResyncRequired));

        // A fresh subscription restarts the feed.
        let _again = hub.subscribe(&scope("prod")).await.unwrap();
    }

    fn channel_of(hub: &BroadcastHub, scope: &Scope) -> Arc<ScopeChannel> {
        hub.inner.scopes.get(scope).unwrap().value().clone()
    }

    #[tokio::test]
    async fn test_disconnect_stops_pump_with_registry() {
        let cluster = MemoryCluster::with_nodes(1);
        let (hub, _) = hub_with(&cluster, HubConfig::default());
        let _sub = hub.subscribe(&scope("prod")).await.unwrap();
        let channel = channel_of(&hub, &scope("prod"));
        assert!(channel.lock().pump.is_some());

        hub.disconnect_scope(&scope("prod"), DisconnectReason::ResyncRequired);
        let registry = channel.lock();
        assert!(!registry.pump_alive);
        assert!(registry.pump.is_none());
    }

    #[tokio::test]
    async fn test_superseded_pump_cannot_detach_its_successor() {
        let cluster = MemoryCluster::with_nodes(1);
        let (hub, gateway) = hub_with(&cluster, HubConfig::default());
        drop(hub.subscribe(&scope("prod")).await.unwrap());
        let channel = channel_of(&hub, &scope("prod"));
        let first = channel.lock().generation;

        hub.disconnect_scope(&scope("prod"), DisconnectReason::ResyncRequired);
        let mut sub = hub.subscribe(&scope("prod")).await.unwrap();
        assert_eq!(channel.fail_all(DisconnectReason::ResyncRequired, Some(first)), 0);
        assert_eq!(hub.subscriber_count(&scope("prod")), 1);

        let key = ConfigKey::parse("svc", "prod", "a").unwrap();
        gateway.put(&key, 1.into(), ConfigMetadata::new("t", "unit")).await.unwrap();
        let event = time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.key, "a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscribe_racing_disconnect_never_lands_on_dead_scope() {
        let cluster = MemoryCluster::with_nodes(1);
        let (hub, gateway) = hub_with(&cluster, HubConfig::default());
        let key = ConfigKey::parse("svc", "prod", "a").unwrap();
        let _anchor = hub.subscribe(&scope("prod")).await.unwrap();

        for round in 0..50i64 {
            let racer = hub.clone();
            let joining = tokio::spawn(async move { racer.subscribe(&scope("prod")).await });
            hub.disconnect_scope(&scope("prod"), DisconnectReason::ResyncRequired);
            let mut sub = joining.await.unwrap().unwrap();

            gateway.put(&key, round.into(), ConfigMetadata::new("t", "unit")).await.unwrap();
            // Either the event arrives or the subscriber is told to resync.
            let outcome = time::timeout(Duration::from_secs(5), sub.recv()).await;
            assert!(outcome.is_ok(), "round {round}: subscriber neither fed nor disconnected");
        }
    }

    #[tokio::test]
    async fn test_close_refuses_new_subscribers() {
        let cluster = MemoryCluster::with_nodes(1);
        let (hub, _) = hub_with(&cluster, HubConfig::default());
        let mut sub = hub.subscribe(&scope("prod")).await.unwrap();
        hub.close();
        assert_eq!(sub.recv().await, Err(DisconnectReason::Shutdown));
        assert!(matches!(hub.subscribe(&scope("prod")).await, Err(HubError::ShutDown)));
    }
}
