//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap every store RPC with a deadline
//! - Fold an elapsed deadline into the same failure as a broken connection
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; dropping the RPC future cancels it
//! - A timed-out RPC is indistinguishable from an unreachable endpoint for
//!   failover purposes

use std::future::Future;
use std::time::Duration;

use crate::storage::backend::StoreError;

/// Run `call`, converting an elapsed deadline into `StoreError::Unreachable`.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unreachable(format!(
            "no response within {}ms",
            deadline.as_millis()
        ))),
    }
}
