use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::feed::FeedError;

/// Why a subscription stopped receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Queue was full when an event arrived.
    Backpressure,
    /// No heartbeat within the configured timeout.
    HeartbeatTimeout,
    /// The scope's change feed failed; reconnect and resync.
    ResyncRequired,
    /// Subscriber asked to leave.
    Unsubscribed,
    /// Delivery channel closed.
    Closed,
    /// Hub is shutting down.
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Backpressure => "backpressure",
            DisconnectReason::HeartbeatTimeout => "heartbeat_timeout",
            DisconnectReason::ResyncRequired => "resync_required",
            DisconnectReason::Unsubscribed => "unsubscribed",
            DisconnectReason::Closed => "closed",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("broadcast hub is shut down")]
    ShutDown,

    #[error("cannot open change feed: {0}")]
    Feed(#[from] FeedError),
}
