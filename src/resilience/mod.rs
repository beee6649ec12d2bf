//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Store RPC:
//!     → timeouts.rs (bounded deadline, elapsed = unreachable)
//!     → gateway failover to the next endpoint
//!
//! Long-lived streams (change feed, cache push channel):
//!     → backoff.rs (exponential delay with jitter, capped)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every store call has a deadline
//! - Jittered backoff prevents reconnect storms after an outage

pub mod backoff;
pub mod timeouts;
