//! Gateway error kinds.

use thiserror::Error;

use crate::model::{KeyError, Version};
use crate::storage::backend::StoreError;

/// Errors surfaced to gateway callers.
///
/// Endpoint-level failures never appear here individually: they are retried
/// across the endpoint set and only reported as `Unavailable` once exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Key absent in the store.
    #[error("configuration not found: {0}")]
    NotFound(String),

    /// No endpoint answered within the retry budget.
    #[error("backing store unavailable after {attempts} attempt(s)")]
    Unavailable { attempts: usize },

    /// Conditional write saw a different current version.
    #[error("version conflict (current: {current:?})")]
    Conflict { current: Option<Version> },

    /// Value rejected before reaching the store, or unreadable once stored.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Malformed namespace, environment or key.
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    /// Watch resume point is older than the store's retained history.
    #[error("revision {requested} compacted (oldest retained: {compacted})")]
    Compacted { requested: u64, compacted: u64 },
}

impl GatewayError {
    /// Errors worth retrying later (as opposed to answers from the store).
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable { .. })
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unreachable(_) => GatewayError::Unavailable { attempts: 1 },
            StoreError::Conflict { current } => GatewayError::Conflict {
                current: current.map(Version::new),
            },
            StoreError::Compacted {
                requested,
                compacted,
            } => GatewayError::Compacted {
                requested,
                compacted,
            },
        }
    }
}
