//! Stored blob format.
//!
//! Values are kept as JSON documents `{ "value": ..., "metadata": {...} }`.
//! The version is not part of the blob: it is the store's mod revision.

use serde::{Deserialize, Serialize};

use crate::model::{ConfigEntry, ConfigKey, ConfigMetadata, ConfigValue, Version};
use crate::storage::backend::KeyValue;

#[derive(Debug, Serialize, Deserialize)]
struct StoredValue {
    value: ConfigValue,
    metadata: ConfigMetadata,
}

/// Serialize a value for writing.
pub fn encode(value: &ConfigValue, metadata: &ConfigMetadata) -> Result<Vec<u8>, serde_json::Error> {
    #[derive(Serialize)]
    struct StoredRef<'a> {
        value: &'a ConfigValue,
        metadata: &'a ConfigMetadata,
    }
    serde_json::to_vec(&StoredRef { value, metadata })
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("key {0:?} is outside the configuration keyspace")]
    ForeignKey(String),
    #[error("malformed value at {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode a stored pair into an entry versioned by its mod revision.
pub fn decode(kv: &KeyValue) -> Result<ConfigEntry, DecodeError> {
    let key = ConfigKey::from_path(&kv.key).ok_or_else(|| DecodeError::ForeignKey(kv.key.clone()))?;
    let stored: StoredValue = serde_json::from_slice(&kv.value).map_err(|source| DecodeError::Malformed {
        key: kv.key.clone(),
        source,
    })?;
    Ok(ConfigEntry::new(
        &key,
        stored.value,
        Version::new(kv.mod_revision),
        stored.metadata,
    ))
}
