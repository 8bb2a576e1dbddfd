//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Ship / offshore sessions produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout log stream
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Structured fields (connection_id, target, exchange_id) on every event
//! - Metric updates are cheap; without an installed recorder they are no-ops

pub mod logging;
pub mod metrics;
