//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer)
//!     → Prometheus scrape on observability.metrics_address
//! ```
//!
//! # Design Decisions
//! - Metric updates go through the `metrics` facade and are no-ops until a
//!   recorder is installed, so library code and tests never need one
//! - Every log line about a scope carries `scope = ns:env`

pub mod logging;
pub mod metrics;
