//! Offshore-side proxy.
//!
//! # Data Flow
//! ```text
//! Ship link
//!     → server.rs (accept, connection limit)
//!     → session.rs (frame in → origin fetch → frame out, or raw tunnel)
//! ```
//!
//! # Design Decisions
//! - A session is the only writer on its link, so no lock is needed
//! - A fresh origin connection per request; nothing is pooled

pub mod server;
pub mod session;

pub use server::OffshoreServer;
pub use session::{LinkSession, SessionSettings};
