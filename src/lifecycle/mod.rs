//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → gateway → monitor → feed → hub → background tasks
//!
//! Shutdown (shutdown.rs):
//!     Signal received → trigger → hub disconnects subscribers → tasks drain
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: storage first, listeners last
//! - Shutdown has a deadline; stragglers are logged, not awaited forever

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use startup::{RelayRuntime, StartupError};
