//! Client-side configuration cache.
//!
//! # Data Flow
//! ```text
//! get(key, default?)
//!     → fresh record            (client.rs)
//!     → StorageGateway::get     (miss or expiry)
//!     → stale record            (store unreachable, within max_stale)
//!     → SchemaDefaults → client default → NotFound / Unavailable
//!
//! sync.rs:
//!     hub subscribe → reconcile whole scope → apply pushes
//!     lost → backoff with jitter → subscribe → reconcile
//! ```
//!
//! # Design Decisions
//! - Records merge by version; an older event never overwrites a newer one
//! - Deletes leave a tombstone so a late put cannot resurrect the key
//! - The staleness clock runs only while both the push channel and the store
//!   are unreachable

pub mod client;
pub mod error;
pub mod record;
pub mod schema;
pub mod sync;

pub use client::{ClientCache, Resolved, ValueSource};
pub use error::CacheError;
pub use record::CacheRecord;
pub use schema::{SchemaDefaults, StaticSchema};
