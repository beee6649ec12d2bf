use std::time::Duration;
use thiserror::Error;

use crate::hub::HubError;
use crate::model::KeyError;
use crate::storage::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Absent everywhere and no default resolved.
    #[error("configuration not found: {0}")]
    NotFound(String),

    /// Store unreachable, nothing cached and no default resolved.
    #[error("configuration unavailable: backing store unreachable")]
    Unavailable,

    /// Disconnected from both store and push channel for longer than allowed.
    #[error("cached value is {age:?} past its last confirmation, beyond the staleness bound")]
    StaleBeyondBound { age: Duration },

    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("value of {key} is not {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("value {value} of {key} is outside [{min:?}, {max:?}]")]
    OutOfRange {
        key: String,
        value: i64,
        min: Option<i64>,
        max: Option<i64>,
    },

    #[error("push channel unavailable: {0}")]
    Push(#[from] HubError),

    #[error(transparent)]
    Gateway(GatewayError),
}

impl From<GatewayError> for CacheError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound(key) => CacheError::NotFound(key),
            GatewayError::Unavailable { .. } => CacheError::Unavailable,
            GatewayError::InvalidKey(e) => CacheError::InvalidKey(e),
            other => CacheError::Gateway(other),
        }
    }
}
