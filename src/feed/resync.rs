//! Snapshot diffing for resync.

use std::collections::HashMap;

use crate::model::{ConfigEntry, Version};
use crate::storage::ScopeSnapshot;

/// One synthesized change.
#[derive(Debug, Clone, PartialEq)]
pub enum ResyncChange {
    Put(ConfigEntry),
    Delete { key: String, version: Version },
}

/// Changes that take a consumer from `known` (key → last emitted version) to
/// `snapshot`: a put for every key whose version differs, a delete for every
/// known key that is gone. Deletes carry the snapshot revision.
///
/// Puts come first in key order, then deletes in key order.
pub fn diff(known: &HashMap<String, Version>, snapshot: &ScopeSnapshot) -> Vec<ResyncChange> {
    let mut changes: Vec<ResyncChange> = snapshot
        .entries
        .iter()
        .filter(|entry| known.get(&entry.key) != Some(&entry.version))
        .cloned()
        .map(ResyncChange::Put)
        .collect();

    let present: std::collections::HashSet<&str> =
        snapshot.entries.iter().map(|e| e.key.as_str()).collect();
    let mut gone: Vec<&String> = known.keys().filter(|k| !present.contains(k.as_str())).collect();
    gone.sort();
    changes.extend(gone.into_iter().map(|key| ResyncChange::Delete {
        key: key.clone(),
        version: snapshot.revision,
    }));
    changes
}

/// Key → version map of a snapshot.
pub fn versions(snapshot: &ScopeSnapshot) -> HashMap<String, Version> {
    snapshot
        .entries
        .iter()
        .map(|e| (e.key.clone(), e.version))
        .collect()
}
