//! Cached entries and the newer-version-wins merge.

use tokio::time::Instant;

use crate::model::{ConfigEntry, ConfigValue, Version};

/// One cached entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub entry: ConfigEntry,
    pub fetched_at: Instant,
    pub valid_until: Instant,
    /// Set on snapshots taken at or past `valid_until`.
    pub stale: bool,
}

impl CacheRecord {
    pub(crate) fn new(entry: ConfigEntry, now: Instant, ttl: std::time::Duration) -> Self {
        Self {
            entry,
            fetched_at: now,
            valid_until: now + ttl,
            stale: false,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.valid_until
    }

    pub fn value(&self) -> &ConfigValue {
        &self.entry.value
    }

    pub fn version(&self) -> Version {
        self.entry.version
    }

    pub(crate) fn annotated(mut self, now: Instant) -> Self {
        self.stale = !self.is_fresh(now);
        self
    }
}

/// What the cache knows about a key.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Live(CacheRecord),
    /// Deleted as of `version`; known absent until `valid_until`.
    Tombstone { version: Version, valid_until: Instant },
}

impl Slot {
    pub(crate) fn version(&self) -> Version {
        match self {
            Slot::Live(record) => record.version(),
            Slot::Tombstone { version, .. } => *version,
        }
    }

    /// Replace `self` with `incoming` unless `self` is newer. An equal
    /// version only refreshes timestamps.
    pub(crate) fn merge(&mut self, incoming: Slot) -> bool {
        let current = self.version();
        let next = incoming.version();
        if next < current {
            return false;
        }
        if next == current && matches!((&*self, &incoming), (Slot::Tombstone { .. }, Slot::Live(_))) {
            return false;
        }
        *self = incoming;
        true
    }
}
