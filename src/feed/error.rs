use thiserror::Error;

use crate::storage::GatewayError;

/// Reasons a change stream ends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// Reconnect/resync kept failing; subscribers must reconnect and resync.
    #[error("resync gave up after {attempts} attempt(s)")]
    ResyncExhausted { attempts: u32 },

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
