//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Probe loop (monitor.rs):
//!     Fixed-interval timer
//!     → status() RPC to every endpoint, concurrently, each bounded
//!     → Endpoint hysteresis (storage/endpoint.rs)
//!     → ClusterSnapshot published via ArcSwap
//!
//! Foreground failures (storage/gateway.rs):
//!     Failed or timed-out call → Endpoint marked unhealthy immediately
//! ```
//!
//! # Design Decisions
//! - Probes never block foreground calls; both write the same atomics
//! - Snapshot readers always see the last completed round
//! - Chaos hooks exist only in test builds and under the `chaos` feature

pub mod monitor;

pub use monitor::{ClusterMonitor, ClusterSnapshot, EndpointStatus};
