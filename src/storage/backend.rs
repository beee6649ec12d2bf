//! Backing-store connection seam.
//!
//! # Responsibilities
//! - Define the primitive operations the gateway needs from one endpoint
//! - Keep the trait object safe so endpoints of one cluster can be held as
//!   `Arc<dyn KvBackend>` regardless of transport
//!
//! # Design Decisions
//! - Revisions are cluster-global and strictly increasing; an entry's
//!   `mod_revision` is its version
//! - `Unreachable` is the only failure the gateway fails over on; every other
//!   error is an answer from the store and is returned as-is

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::model::ChangeKind;

/// Errors reported by a single backing-store endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Connection failed, was refused, or broke mid-stream.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// Conditional write precondition did not hold.
    #[error("revision conflict (current: {current:?})")]
    Conflict { current: Option<u64> },

    /// Requested watch start is older than the retained history.
    #[error("revision {requested} compacted (oldest retained: {compacted})")]
    Compacted { requested: u64, compacted: u64 },
}

/// A raw key/value pair as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: u64,
    pub mod_revision: u64,
}

/// Result of a prefix read.
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    /// Key-sorted entries under the prefix.
    pub kvs: Vec<KeyValue>,
    /// Store revision the read was served at.
    pub revision: u64,
}

/// One change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: ChangeKind,
    /// For deletes, `value` is empty and `mod_revision` is the deletion revision.
    pub kv: KeyValue,
}

impl WatchEvent {
    pub fn revision(&self) -> u64 {
        self.kv.mod_revision
    }
}

/// Write precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    Always,
    /// Key must not exist.
    Absent,
    /// Key's current mod revision must equal this one.
    Revision(u64),
}

/// Health RPC answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub is_leader: bool,
    pub revision: u64,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// One connection to one backing-store endpoint.
pub trait KvBackend: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<KeyValue>, StoreError>>;

    fn range<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<RangeResult, StoreError>>;

    /// Returns the revision stamped on the written key.
    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        condition: PutCondition,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Returns the deletion revision, or `None` if the key was absent.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<u64>, StoreError>>;

    /// Stream changes under `prefix`, starting at `start_revision` (inclusive)
    /// or at the next change when `None`.
    fn watch<'a>(
        &'a self,
        prefix: &'a str,
        start_revision: Option<u64>,
    ) -> BoxFuture<'a, Result<WatchStream, StoreError>>;

    fn status(&self) -> BoxFuture<'_, Result<NodeStatus, StoreError>>;
}
