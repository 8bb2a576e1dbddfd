//! Request reading and target resolution.
//!
//! # Responsibilities
//! - Read a complete client request (head and body) off the client socket
//! - Parse a framed request on the offshore side
//! - Decide which origin a request is for (CONNECT authority or `Host`)

use std::fmt;
use std::str::FromStr;

use bytes::BytesMut;
use http::uri::{Authority, Scheme};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use tokio::io::AsyncRead;

use crate::http::body::{request_body_length, MessageReader};
use crate::http::{HttpError, MAX_HEADERS};

const DEFAULT_HTTP_PORT: u16 = 80;
const DEFAULT_HTTPS_PORT: u16 = 443;

/// Parsed request line and header section.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request target exactly as sent (authority, absolute or origin form).
    pub target: String,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Parses a head from the start of `buf`; `None` while incomplete.
    ///
    /// Returns the length of the head section and the head.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf)? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(len) => {
                let method = req
                    .method
                    .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
                    .ok_or(HttpError::Malformed("invalid method"))?;
                let target = req
                    .path
                    .ok_or(HttpError::Malformed("missing request target"))?
                    .to_string();
                let headers = HeaderMap::from_iter(req.headers.iter().flat_map(|h| {
                    let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    Some((name, value))
                }));
                Ok(Some((len, Self { method, target, headers })))
            }
        }
    }

    /// Parses a complete head, e.g. from a frame payload.
    pub fn parse(buf: &[u8]) -> Result<Self, HttpError> {
        Self::parse_with_len(buf)?
            .map(|(_, head)| head)
            .ok_or(HttpError::Malformed("incomplete request head"))
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get(http::header::HOST).and_then(|v| v.to_str().ok())
    }

    /// Determines the origin this request must be sent to.
    ///
    /// CONNECT uses its authority-form target, which must carry a port.
    /// Everything else uses `Host` (default port 80), falling back to the
    /// authority of an absolute-form target.
    pub fn resolve_target(&self) -> Result<Target, HttpError> {
        if self.is_connect() {
            return Target::from_authority(&self.target, None);
        }
        if let Some(host) = self.host() {
            return Target::from_authority(host, Some(DEFAULT_HTTP_PORT));
        }
        let uri = Uri::from_str(&self.target)
            .map_err(|_| HttpError::InvalidTarget(self.target.clone()))?;
        match (uri.scheme(), uri.authority()) {
            (Some(scheme), Some(authority)) => {
                let default_port = if *scheme == Scheme::HTTPS {
                    DEFAULT_HTTPS_PORT
                } else {
                    DEFAULT_HTTP_PORT
                };
                Target::from_authority(authority.as_str(), Some(default_port))
            }
            _ => Err(HttpError::Malformed("missing Host header")),
        }
    }
}

/// Origin host and port a request is routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Hostname or IP literal, without brackets.
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Parses `host[:port]`; without a port, `default_port` applies or the
    /// authority is rejected.
    pub fn from_authority(s: &str, default_port: Option<u16>) -> Result<Self, HttpError> {
        let authority =
            Authority::from_str(s.trim()).map_err(|_| HttpError::InvalidTarget(s.to_string()))?;
        let port = authority
            .port_u16()
            .or(default_port)
            .ok_or_else(|| HttpError::InvalidTarget(format!("{s}: port required")))?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err(HttpError::InvalidTarget(s.to_string()));
        }
        Ok(Self { host, port })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A complete request read from a client socket.
#[derive(Debug)]
pub struct ClientRequest {
    pub head: RequestHead,
    /// Head and body exactly as received.
    pub raw: Vec<u8>,
    /// Bytes the client sent past the end of the request; for CONNECT this
    /// is the start of the tunnelled stream.
    pub early_data: BytesMut,
}

/// Reads one request, including any Content-Length or chunked body.
pub async fn read_request<R>(
    reader: R,
    max_header: usize,
    max_message: usize,
) -> Result<ClientRequest, HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = MessageReader::new(reader, max_message);
    let head = reader.read_head(max_header, RequestHead::parse_with_len).await?;
    if !head.is_connect() {
        let length = request_body_length(&head.headers)?;
        reader.read_body(length).await?;
    }
    let (raw, early_data) = reader.into_parts();
    Ok(ClientRequest { head, raw, early_data })
}
