//! Broadcast hub subscribing live consumers to scopes.
//!
//! # Data Flow
//! ```text
//! BroadcastHub::subscribe(scope)
//!     → ScopeChannel (one per scope, created on demand)
//!         → pump task: ChangeFeed stream → publish()
//!         → ArcSwap<Vec<SubscriberSlot>> read without locks on publish
//!     → Subscription (bounded mpsc receiver + heartbeat)
//!
//! Reaper (run()):
//!     heartbeat timeout → disconnect; empty scope → pump stopped, channel retired
//! ```
//!
//! # Design Decisions
//! - Delivery is `try_send`: a full queue disconnects that subscriber with
//!   `backpressure`; other subscribers never wait on it
//! - A failed feed disconnects the whole scope with `resync_required`
//! - Subscriptions are scope-partitioned so fan-out cost follows the
//!   scope's subscriber count only

pub mod broadcast;
pub mod error;
pub mod subscription;

pub use broadcast::BroadcastHub;
pub use error::{DisconnectReason, HubError};
pub use subscription::Subscription;
