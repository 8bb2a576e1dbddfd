//! HTTP/1.1 message handling.
//!
//! # Data Flow
//! ```text
//! Ship:     client socket → request.rs (head + body, verbatim bytes) → frame
//! Offshore: frame → request.rs (RequestHead, Target) → origin socket
//!           origin socket → response.rs (head + body per framing) → frame
//! ```
//!
//! # Design Decisions
//! - Messages are carried verbatim; parsing only decides where a message ends
//!   and where it goes
//! - Body length follows RFC 9112: chunked, then Content-Length, then
//!   close-delimited (responses only)
//! - Every read is bounded by a byte limit

pub mod body;
pub mod request;
pub mod response;

use http::StatusCode;
use thiserror::Error;

pub use request::{read_request, ClientRequest, RequestHead, Target};
pub use response::{error_response, read_response, OriginResponse, CONNECTION_ESTABLISHED};

/// Maximum number of header fields parsed per message.
pub const MAX_HEADERS: usize = 100;

/// Errors raised while reading or interpreting an HTTP message.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Peer closed before sending a single byte.
    #[error("connection closed before any data")]
    Closed,

    /// Peer closed in the middle of a message.
    #[error("connection closed mid-message")]
    Incomplete,

    #[error("malformed message: {0}")]
    Parse(#[from] httparse::Error),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("header section exceeds {max} bytes")]
    HeaderTooLarge { max: usize },

    #[error("message exceeds {max} bytes")]
    TooLarge { max: usize },

    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HttpError {
    /// Status the ship answers with when a client request fails this way.
    pub fn client_status(&self) -> StatusCode {
        match self {
            HttpError::HeaderTooLarge { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            HttpError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}
