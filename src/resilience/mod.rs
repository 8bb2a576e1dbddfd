//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Dial to origin (offshore):
//!     → timeouts.rs (connect deadline → 504, refusal → 502)
//! Origin response (offshore):
//!     → timeouts.rs (request deadline → 504)
//! Inter-proxy link lost (ship):
//!     → backoff.rs (re-dial with exponential backoff + jitter)
//! ```
//!
//! # Design Decisions
//! - Every external dial has a deadline
//! - Requests are never retried; only the link is re-established

pub mod backoff;
pub mod timeouts;

pub use backoff::calculate_backoff;
pub use timeouts::{connect_with_timeout, with_deadline, DialError, TimedOut};
