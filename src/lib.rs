//! Replicated configuration relay.
//!
//! Stores namespaced configuration in a multi-endpoint key-value cluster,
//! turns store watches into ordered change streams, fans them out to push
//! subscribers, and keeps client-side caches that degrade gracefully when the
//! cluster is unreachable.

pub mod cache;
pub mod config;
pub mod feed;
pub mod health;
pub mod http;
pub mod hub;
pub mod lifecycle;
pub mod model;
pub mod observability;
pub mod resilience;
pub mod storage;

pub use config::RelayConfig;
pub use http::HttpServer;
pub use lifecycle::{RelayRuntime, Shutdown};
