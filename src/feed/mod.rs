//! Change feed subsystem.
//!
//! # Data Flow
//! ```text
//! ChangeFeed::subscribe(scope, resume?)
//!     → silent baseline snapshot (fresh streams)
//!     → worker task: StorageGateway::watch from last revision + 1
//!         stream breaks  → reopen from last revision (gateway fails over)
//!         compacted      → resync.rs: snapshot diff → synthesized events
//!         open failures  → backoff; budget exhausted → ResyncExhausted
//!     → bounded mpsc → ChangeStream::recv
//! ```
//!
//! # Design Decisions
//! - Delivery is at-least-once; consumers apply by key, highest version wins
//! - Per-key events arrive in version order; nothing is promised across keys
//! - Sequence ids are per stream and restart with every subscription

pub mod change_feed;
pub mod error;
pub mod resync;

pub use change_feed::{ChangeFeed, ChangeStream};
pub use error::FeedError;
