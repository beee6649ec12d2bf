//! Subscriber-side handle.

use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::hub::broadcast::ScopeChannel;
use crate::hub::error::DisconnectReason;
use crate::model::{ChangeEvent, Scope};

/// State shared between a subscription and the hub's registry entry.
#[derive(Debug)]
pub(crate) struct SubscriberState {
    last_heartbeat: Mutex<Instant>,
    reason: OnceLock<DisconnectReason>,
}

impl SubscriberState {
    pub(crate) fn new() -> Self {
        Self {
            last_heartbeat: Mutex::new(Instant::now()),
            reason: OnceLock::new(),
        }
    }

    pub(crate) fn beat(&self) {
        *self.last_heartbeat.lock().expect("heartbeat mutex poisoned") = Instant::now();
    }

    pub(crate) fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock().expect("heartbeat mutex poisoned")
    }

    /// First reason wins. Returns true if this call set it.
    pub(crate) fn close(&self, reason: DisconnectReason) -> bool {
        self.reason.set(reason).is_ok()
    }

    pub(crate) fn reason(&self) -> Option<DisconnectReason> {
        self.reason.get().copied()
    }
}

/// The hub's side of one subscription.
#[derive(Debug)]
pub(crate) struct SubscriberSlot {
    pub(crate) id: Uuid,
    pub(crate) tx: mpsc::Sender<Arc<ChangeEvent>>,
    pub(crate) state: Arc<SubscriberState>,
}

/// A live subscription to one scope.
///
/// Events arrive on a bounded queue owned by this subscription. Dropping it
/// (or calling [`Subscription::unsubscribe`]) releases the queue; anything
/// still queued is discarded.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    scope: Scope,
    registered_at: u64,
    rx: mpsc::Receiver<Arc<ChangeEvent>>,
    state: Arc<SubscriberState>,
    channel: Arc<ScopeChannel>,
}

impl Subscription {
    pub(crate) fn new(
        id: Uuid,
        scope: Scope,
        rx: mpsc::Receiver<Arc<ChangeEvent>>,
        state: Arc<SubscriberState>,
        channel: Arc<ScopeChannel>,
    ) -> Self {
        Self {
            id,
            scope,
            registered_at: crate::model::epoch_millis(),
            rx,
            state,
            channel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Milliseconds since the unix epoch.
    pub fn registered_at(&self) -> u64 {
        self.registered_at
    }

    /// Next event, or the reason this subscription was disconnected.
    ///
    /// Once disconnected, queued events are no longer handed out.
    pub async fn recv(&mut self) -> Result<Arc<ChangeEvent>, DisconnectReason> {
        if let Some(reason) = self.state.reason() {
            return Err(reason);
        }
        match self.rx.recv().await {
            Some(event) => match self.state.reason() {
                Some(reason) => Err(reason),
                None => Ok(event),
            },
            None => Err(self.state.reason().unwrap_or(DisconnectReason::Closed)),
        }
    }

    /// Liveness signal; must be sent at least once per heartbeat timeout.
    pub fn heartbeat(&self) {
        self.state.beat();
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.state.reason()
    }

    /// Leave the scope. No event is delivered after this returns.
    pub fn unsubscribe(self) {
        self.state.close(DisconnectReason::Unsubscribed);
        self.channel.remove(self.id, DisconnectReason::Unsubscribed);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.state.reason().is_none() {
            self.state.close(DisconnectReason::Closed);
            self.channel.remove(self.id, DisconnectReason::Closed);
        }
    }
}
