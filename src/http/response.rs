//! Response reading and canned responses.

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::io::AsyncRead;

use crate::http::body::{response_body_length, MessageReader};
use crate::http::{HttpError, MAX_HEADERS};

/// Reply that acknowledges a CONNECT tunnel.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Parsed status line and header section.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Parses a head from the start of `buf`; `None` while incomplete.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf)? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(len) => {
                let status = res
                    .code
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .ok_or(HttpError::Malformed("invalid status code"))?;
                let headers = HeaderMap::from_iter(res.headers.iter().flat_map(|h| {
                    let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    Some((name, value))
                }));
                Ok(Some((len, Self { status, headers })))
            }
        }
    }
}

/// Status of a complete response held in memory, if it parses.
pub fn status_of(response: &[u8]) -> Option<StatusCode> {
    ResponseHead::parse_with_len(response)
        .ok()
        .flatten()
        .map(|(_, head)| head.status)
}

/// A complete origin response.
#[derive(Debug)]
pub struct OriginResponse {
    /// Final (non-interim) status.
    pub status: StatusCode,
    /// Every byte of the response, interim responses included.
    pub raw: Vec<u8>,
}

/// Reads one full response from an origin.
///
/// Interim `1xx` responses other than `101` are kept and the next head is
/// read. The body follows HTTP/1.1 framing; with neither chunked encoding
/// nor Content-Length it runs until the origin closes.
pub async fn read_response<R>(
    reader: R,
    request_is_head: bool,
    max_header: usize,
    max_message: usize,
) -> Result<OriginResponse, HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = MessageReader::new(reader, max_message);
    loop {
        let head = reader.read_head(max_header, ResponseHead::parse_with_len).await?;
        if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            continue;
        }
        let length = response_body_length(head.status.as_u16(), request_is_head, &head.headers)?;
        reader.read_body(length).await?;
        let (raw, _) = reader.into_parts();
        return Ok(OriginResponse {
            status: head.status,
            raw,
        });
    }
}

/// A minimal self-contained error response.
pub fn error_response(status: StatusCode) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let body = format!("{} {}\n", status.as_u16(), reason);
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        reason,
        body.len(),
        body
    )
    .into_bytes()
}
