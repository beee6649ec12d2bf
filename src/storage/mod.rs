//! Storage subsystem.
//!
//! # Data Flow
//! ```text
//! Caller (feed, cache, HTTP handlers):
//!     → gateway.rs (validate, pick endpoint, failover)
//!     → endpoint.rs (health bookkeeping per endpoint)
//!     → backend.rs (KvBackend: one connection to one node)
//!     → memory.rs (bundled in-process replicated store)
//!
//! Stored blobs:
//!     ConfigValue + ConfigMetadata ←→ codec.rs ←→ JSON bytes
//!     version = store mod_revision (out of band)
//! ```
//!
//! # Design Decisions
//! - The gateway never hides "unavailable" behind "not found"
//! - Health state is per endpoint and shared with the cluster monitor

pub mod backend;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod memory;

pub use backend::{KvBackend, NodeStatus, PutCondition, StoreError};
pub use endpoint::{Endpoint, HealthState};
pub use error::GatewayError;
pub use gateway::{ScopeSnapshot, ScopeWatch, StorageGateway, StoreChange};
pub use memory::{MemoryCluster, MemoryNode};
