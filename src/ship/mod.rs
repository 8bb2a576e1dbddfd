//! Ship-side proxy.
//!
//! # Data Flow
//! ```text
//! Local client
//!     → server.rs (read request, local 4xx on bad input)
//!     → link.rs (exclusive lease: frame out, frame back)
//!     → server.rs (relay response, or bridge a CONNECT tunnel)
//! ```
//!
//! # Design Decisions
//! - One link to the offshore proxy, shared by all clients and used by
//!   one exchange at a time
//! - A tunnel owns the link until it ends; the link is then re-dialled

pub mod link;
pub mod server;

pub use link::{LinkError, LinkLease, ShipLink};
pub use server::ShipServer;
