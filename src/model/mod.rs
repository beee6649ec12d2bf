//! Configuration data model.
//!
//! # Data Flow
//! ```text
//! Writer (namespace, environment, key, value, metadata)
//!     → key.rs (syntax validation, store path)
//!     → value.rs (closed JSON-like value)
//!     → entry.rs (ConfigEntry stamped with a store Version)
//!     → event.rs (ChangeEvent emitted by the change feed)
//! ```
//!
//! # Design Decisions
//! - Scope and key syntax are validated once at construction; invalid input
//!   never reaches the store and is never retried
//! - Versions are store revisions: opaque to callers, ordered, strictly
//!   increasing per key
//! - Entries are immutable once stamped with a version

pub mod entry;
pub mod event;
pub mod key;
pub mod value;

pub use entry::{ConfigEntry, ConfigMetadata, Version};
pub use event::{ChangeEvent, ChangeKind};
pub use key::{ConfigKey, KeyError, Scope};
pub use value::ConfigValue;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, used for wall-clock stamps on entries and events.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
