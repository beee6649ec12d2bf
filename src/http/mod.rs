//! HTTP subsystem.
//!
//! # Data Flow
//! ```text
//! REST request → server.rs (trace, timeout) → handlers.rs → StorageGateway
//!                                                      └→ ClusterMonitor
//! WebSocket    → websocket.rs → BroadcastHub::subscribe → push frames
//! Errors       → error.rs (404 / 409 / 400 / 503)
//! ```
//!
//! # Design Decisions
//! - Thin layer: no business logic, only translation to and from JSON
//! - The push channel has no request timeout; its liveness is the hub heartbeat

pub mod error;
pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::{AppState, HttpServer};
