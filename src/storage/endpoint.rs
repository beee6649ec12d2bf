//! Backing-store endpoint abstraction.
//!
//! # Responsibilities
//! - Represent a single backing-store endpoint and its connection
//! - Track health state (Unknown/Healthy/Unhealthy) with probe hysteresis
//! - Track the last probe time and whether the endpoint believes it leads
//!
//! # State Transitions
//! ```text
//! any → Unhealthy: foreground failure observed by the gateway (immediate)
//! any → Unhealthy: consecutive probe failures >= unhealthy_threshold
//! any → Healthy:   consecutive probe successes >= healthy_threshold,
//!                  or a successful foreground call
//! ```
//!
//! Every transition is logged exactly once, by whichever observer caused it.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::observability::metrics;
use crate::storage::backend::KvBackend;

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

/// A single backing-store endpoint.
pub struct Endpoint {
    /// Position in the configured endpoint list.
    pub index: usize,
    /// Configured address.
    pub address: String,
    client: Arc<dyn KvBackend>,

    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,
    /// Milliseconds since the unix epoch of the last completed probe (0 = never).
    last_probe_at: AtomicU64,
    leader: AtomicBool,
    forced_down: AtomicBool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("index", &self.index)
            .field("address", &self.address)
            .field("health", &self.health())
            .field("leader", &self.is_leader())
            .finish()
    }
}

impl Endpoint {
    pub fn new(index: usize, address: impl Into<String>, client: Arc<dyn KvBackend>) -> Self {
        Self {
            index,
            address: address.into(),
            client,
            state: AtomicU8::new(HealthState::Unknown as u8),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
            last_probe_at: AtomicU64::new(0),
            leader: AtomicBool::new(false),
            forced_down: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> Arc<dyn KvBackend> {
        self.client.clone()
    }

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    /// Healthy or not yet probed.
    pub fn is_usable(&self) -> bool {
        self.health() != HealthState::Unhealthy && !self.is_forced_down()
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }

    pub fn last_probe_at(&self) -> Option<u64> {
        match self.last_probe_at.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn is_forced_down(&self) -> bool {
        self.forced_down.load(Ordering::Acquire)
    }

    #[cfg(any(test, feature = "chaos"))]
    pub(crate) fn set_forced_down(&self, down: bool) {
        self.forced_down.store(down, Ordering::Release);
    }

    /// Swap in a new health state. Returns true (and logs) only on an actual change.
    pub(crate) fn transition(&self, next: HealthState, cause: &str) -> bool {
        let previous = HealthState::from(self.state.swap(next as u8, Ordering::AcqRel));
        if previous == next {
            return false;
        }
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        match next {
            HealthState::Unhealthy => tracing::warn!(
                endpoint = %self.address,
                from = ?previous,
                cause,
                "Endpoint marked unhealthy"
            ),
            _ => tracing::info!(
                endpoint = %self.address,
                from = ?previous,
                to = ?next,
                cause,
                "Endpoint health changed"
            ),
        }
        metrics::record_endpoint_health(&self.address, next == HealthState::Healthy);
        true
    }

    /// Foreground call succeeded.
    pub(crate) fn observe_success(&self) {
        if self.health() != HealthState::Healthy {
            self.transition(HealthState::Healthy, "request succeeded");
        }
    }

    /// Foreground call failed or timed out.
    pub(crate) fn observe_failure(&self, cause: &str) {
        self.transition(HealthState::Unhealthy, cause);
    }

    /// Report a successful probe.
    pub(crate) fn probe_succeeded(&self, is_leader: bool, at_ms: u64, healthy_threshold: usize) {
        self.last_probe_at.store(at_ms, Ordering::Relaxed);
        self.leader.store(is_leader, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.health() == HealthState::Healthy {
            return;
        }
        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if successes >= healthy_threshold {
            self.transition(HealthState::Healthy, "probe succeeded");
        }
    }

    /// Report a failed probe.
    pub(crate) fn probe_failed(&self, at_ms: u64, unhealthy_threshold: usize, cause: &str) {
        self.last_probe_at.store(at_ms, Ordering::Relaxed);
        self.leader.store(false, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        if self.health() == HealthState::Unhealthy {
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= unhealthy_threshold {
            self.transition(HealthState::Unhealthy, cause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryCluster;

    fn endpoint() -> Endpoint {
        let cluster = MemoryCluster::with_nodes(1);
        Endpoint::new(0, "memory://node-0", Arc::new(cluster.node(0)))
    }

    #[test]
    fn test_transition_reports_only_real_changes() {
        let ep = endpoint();
        assert!(ep.transition(HealthState::Healthy, "test"));
        assert!(!ep.transition(HealthState::Healthy, "test"));
        assert!(ep.transition(HealthState::Unhealthy, "test"));
        assert!(!ep.transition(HealthState::Unhealthy, "test"));
    }

    #[test]
    fn test_probe_hysteresis() {
        let ep = endpoint();
        ep.probe_failed(1, 2, "timeout");
        assert_eq!(ep.health(), HealthState::Unknown);
        ep.probe_failed(2, 2, "timeout");
        assert_eq!(ep.health(), HealthState::Unhealthy);

        ep.probe_succeeded(true, 3, 2);
        assert_eq!(ep.health(), HealthState::Unhealthy);
        ep.probe_succeeded(true, 4, 2);
        assert_eq!(ep.health(), HealthState::Healthy);
        assert!(ep.is_leader());
        assert_eq!(ep.last_probe_at(), Some(4));
    }

    #[test]
    fn test_foreground_failure_is_immediate() {
        let ep = endpoint();
        ep.observe_success();
        assert_eq!(ep.health(), HealthState::Healthy);
        ep.observe_failure("connection refused");
        assert_eq!(ep.health(), HealthState::Unhealthy);
        assert!(!ep.is_usable());
    }

    #[test]
    fn test_forced_down_is_not_usable() {
        let ep = endpoint();
        ep.set_forced_down(true);
        assert!(!ep.is_usable());
        ep.set_forced_down(false);
        assert!(ep.is_usable());
    }
}
