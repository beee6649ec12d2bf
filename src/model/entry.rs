//! Stored configuration entries.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::key::{ConfigKey, KeyError, Scope};
use crate::model::value::ConfigValue;

/// Store revision at which an entry was last modified.
///
/// Opaque to callers beyond its ordering: strictly increasing per key, never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const fn new(revision: u64) -> Self {
        Self(revision)
    }

    pub const fn revision(self) -> u64 {
        self.0
    }
}

impl From<u64> for Version {
    fn from(revision: u64) -> Self {
        Self(revision)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who wrote an entry, when, and through which channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigMetadata {
    pub created_by: String,
    /// Milliseconds since the unix epoch.
    pub created_at: u64,
    /// Write channel, e.g. "api", "gitops", "scheduled-deploy".
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
}

impl ConfigMetadata {
    pub fn new(created_by: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
            created_at: crate::model::epoch_millis(),
            source: source.into(),
            approved_by: None,
            git_commit: None,
        }
    }
}

/// A configuration value stamped with its store version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub namespace: String,
    pub environment: String,
    pub key: String,
    pub value: ConfigValue,
    pub version: Version,
    pub metadata: ConfigMetadata,
}

impl ConfigEntry {
    pub fn new(key: &ConfigKey, value: ConfigValue, version: Version, metadata: ConfigMetadata) -> Self {
        Self {
            namespace: key.scope().namespace().to_string(),
            environment: key.scope().environment().to_string(),
            key: key.key().to_string(),
            value,
            version,
            metadata,
        }
    }

    pub fn scope(&self) -> Result<Scope, KeyError> {
        Scope::new(self.namespace.clone(), self.environment.clone())
    }

    pub fn config_key(&self) -> Result<ConfigKey, KeyError> {
        ConfigKey::parse(&self.namespace, &self.environment, &self.key)
    }
}
