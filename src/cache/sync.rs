//! Push-channel maintenance for a [`ClientCache`].

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::cache::client::ClientCache;
use crate::cache::error::CacheError;
use crate::hub::Subscription;
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::resilience::backoff::Backoff;

impl ClientCache {
    /// Keep the cache subscribed to its scope until shutdown.
    pub fn spawn(&self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(self.clone().sync_loop(shutdown))
    }

    async fn sync_loop(self, mut shutdown: ShutdownSignal) {
        let config = self.inner.config.clone();
        let mut backoff = Backoff::new(config.reconnect_base_ms, config.reconnect_max_ms);

        loop {
            let connected = tokio::select! {
                result = self.connect() => result,
                _ = shutdown.wait() => return,
            };

            let mut subscription = match connected {
                Ok(subscription) => subscription,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        scope = %self.inner.scope,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Push channel reconnect failed"
                    );
                    tokio::select! {
                        _ = time::sleep(delay) => continue,
                        _ = shutdown.wait() => return,
                    }
                }
            };

            if backoff.attempts() > 0 {
                tracing::info!(scope = %self.inner.scope, attempts = backoff.attempts(), "Push channel recovered");
            }
            backoff.reset();
            self.push_connected();

            let mut heartbeat = time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let reason = loop {
                tokio::select! {
                    received = subscription.recv() => match received {
                        Ok(event) => self.apply_event(&event),
                        Err(reason) => break reason,
                    },
                    _ = heartbeat.tick() => subscription.heartbeat(),
                    _ = shutdown.wait() => {
                        subscription.unsubscribe();
                        self.push_lost();
                        return;
                    }
                }
            };

            self.push_lost();
            tracing::warn!(scope = %self.inner.scope, %reason, "Push channel lost, reconnecting");
        }
    }

    /// Subscribe first, then reconcile, so no change falls between the two.
    async fn connect(&self) -> Result<Subscription, CacheError> {
        let subscription = self.inner.hub.subscribe(&self.inner.scope).await?;
        self.reconcile().await?;
        Ok(subscription)
    }
}
