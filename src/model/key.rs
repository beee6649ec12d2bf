//! Scope and key identifiers.
//!
//! Keys live in the backing store under `/config/{namespace}/{environment}/{key}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Root of every configuration path in the backing store.
pub const KEY_ROOT: &str = "/config";

const MAX_SEGMENT_LEN: usize = 128;
const MAX_KEY_LEN: usize = 256;

/// Malformed namespace, environment or key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} contains invalid character {ch:?}")]
    InvalidChar { field: &'static str, ch: char },

    #[error("{field} must not be a relative path component")]
    Relative { field: &'static str },
}

fn validate_segment(field: &'static str, value: &str, max: usize) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Empty { field });
    }
    if value.len() > max {
        return Err(KeyError::TooLong { field, max });
    }
    if value == "." || value == ".." {
        return Err(KeyError::Relative { field });
    }
    if let Some(ch) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(KeyError::InvalidChar { field, ch });
    }
    Ok(())
}

/// A (namespace, environment) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    namespace: String,
    environment: String,
}

impl Scope {
    pub fn new(namespace: impl Into<String>, environment: impl Into<String>) -> Result<Self, KeyError> {
        let namespace = namespace.into();
        let environment = environment.into();
        validate_segment("namespace", &namespace, MAX_SEGMENT_LEN)?;
        validate_segment("environment", &environment, MAX_SEGMENT_LEN)?;
        Ok(Self { namespace, environment })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Store prefix covering every key of this scope (trailing slash included).
    pub fn prefix(&self) -> String {
        format!("{}/{}/{}/", KEY_ROOT, self.namespace, self.environment)
    }

    pub fn key(&self, key: impl Into<String>) -> Result<ConfigKey, KeyError> {
        ConfigKey::new(self.clone(), key)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.environment)
    }
}

/// A fully qualified configuration key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigKey {
    scope: Scope,
    key: String,
}

impl ConfigKey {
    pub fn new(scope: Scope, key: impl Into<String>) -> Result<Self, KeyError> {
        let key = key.into();
        validate_segment("key", &key, MAX_KEY_LEN)?;
        Ok(Self { scope, key })
    }

    /// Validate all three parts at once.
    pub fn parse(namespace: &str, environment: &str, key: &str) -> Result<Self, KeyError> {
        Self::new(Scope::new(namespace, environment)?, key)
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Path of this key in the backing store.
    pub fn path(&self) -> String {
        format!("{}{}", self.scope.prefix(), self.key)
    }

    /// Inverse of [`ConfigKey::path`]. Returns `None` for anything outside the
    /// configuration keyspace or with invalid segments.
    pub fn from_path(path: &str) -> Option<Self> {
        let rest = path.strip_prefix(KEY_ROOT)?.strip_prefix('/')?;
        let mut parts = rest.splitn(3, '/');
        let namespace = parts.next()?;
        let environment = parts.next()?;
        let key = parts.next()?;
        Self::parse(namespace, environment, key).ok()
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.key)
    }
}
