//! Change events produced by the change feed.

use serde::{Deserialize, Serialize};

use crate::model::entry::{ConfigEntry, Version};
use crate::model::key::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Put,
    Delete,
}

/// One change to one key of a scope.
///
/// Consumers apply events idempotently: by key, keeping the highest version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub scope: Scope,
    pub key: String,
    /// Snapshot of the entry after a put; `None` for deletes.
    pub entry: Option<ConfigEntry>,
    /// Entry version for puts, deletion revision for deletes.
    pub version: Version,
    /// Strictly increasing within one continuous feed stream of a scope.
    pub seq: u64,
    /// Milliseconds since the unix epoch at emission.
    pub timestamp: u64,
}

impl ChangeEvent {
    pub fn put(scope: Scope, entry: ConfigEntry, seq: u64) -> Self {
        Self {
            kind: ChangeKind::Put,
            scope,
            key: entry.key.clone(),
            version: entry.version,
            entry: Some(entry),
            seq,
            timestamp: crate::model::epoch_millis(),
        }
    }

    pub fn delete(scope: Scope, key: impl Into<String>, version: Version, seq: u64) -> Self {
        Self {
            kind: ChangeKind::Delete,
            scope,
            key: key.into(),
            entry: None,
            version,
            seq,
            timestamp: crate::model::epoch_millis(),
        }
    }
}
