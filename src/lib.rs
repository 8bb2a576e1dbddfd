//! Two-hop HTTP/HTTPS forward proxy.
//!
//! The ship proxy accepts local clients and relays every request over a
//! single length-prefixed TCP link to the offshore proxy, which performs
//! the real fetch or opens the CONNECT tunnel.

// Roles
pub mod offshore;
pub mod ship;

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod protocol;

// Cross-cutting concerns
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use lifecycle::Shutdown;
pub use offshore::OffshoreServer;
pub use ship::ShipServer;
