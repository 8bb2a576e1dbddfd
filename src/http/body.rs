//! Message framing: where an HTTP/1.1 message ends.
//!
//! [`MessageReader`] pulls bytes from a socket, hands the unconsumed buffer
//! to a head parser and then walks the body according to [`BodyLength`].
//! Everything it consumes is kept verbatim so the message can be forwarded
//! byte-for-byte.

use bytes::{Buf, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::http::HttpError;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const MAX_LINE_BYTES: usize = 8 * 1024;

/// How the body of a message is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// No body follows the head.
    Empty,
    /// Exactly this many bytes follow.
    Fixed(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Body runs until the peer closes (responses only).
    UntilClose,
}

/// Body length of a request per RFC 9112 §6.3.
pub fn request_body_length(headers: &HeaderMap) -> Result<BodyLength, HttpError> {
    if let Some(chunked) = transfer_encoding_is_chunked(headers)? {
        if !chunked {
            return Err(HttpError::Malformed("request transfer-encoding must end in chunked"));
        }
        return Ok(BodyLength::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) | None => BodyLength::Empty,
        Some(len) => BodyLength::Fixed(len),
    })
}

/// Body length of a response to a request with the given method.
pub fn response_body_length(
    status: u16,
    request_is_head: bool,
    headers: &HeaderMap,
) -> Result<BodyLength, HttpError> {
    if request_is_head || (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(BodyLength::Empty);
    }
    match transfer_encoding_is_chunked(headers)? {
        Some(true) => return Ok(BodyLength::Chunked),
        Some(false) => return Ok(BodyLength::UntilClose),
        None => {}
    }
    Ok(match content_length(headers)? {
        Some(0) => BodyLength::Empty,
        Some(len) => BodyLength::Fixed(len),
        None => BodyLength::UntilClose,
    })
}

/// `None` when no Transfer-Encoding is present, otherwise whether the final
/// coding is `chunked`.
fn transfer_encoding_is_chunked(headers: &HeaderMap) -> Result<Option<bool>, HttpError> {
    let mut last = None;
    for value in headers.get_all(TRANSFER_ENCODING) {
        let value = value
            .to_str()
            .map_err(|_| HttpError::Malformed("non-ascii transfer-encoding"))?;
        if let Some(coding) = value.split(',').map(str::trim).filter(|c| !c.is_empty()).last() {
            last = Some(coding.eq_ignore_ascii_case("chunked"));
        }
    }
    Ok(last)
}

/// Parses Content-Length, rejecting conflicting duplicates.
fn content_length(headers: &HeaderMap) -> Result<Option<u64>, HttpError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let value = value
            .to_str()
            .map_err(|_| HttpError::Malformed("non-ascii content-length"))?;
        for part in value.split(',') {
            let parsed: u64 = part
                .trim()
                .parse()
                .map_err(|_| HttpError::Malformed("invalid content-length"))?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(HttpError::Malformed("conflicting content-length values"));
                }
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

/// Buffered reader that records every consumed byte.
#[derive(Debug)]
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
    raw: Vec<u8>,
    max_message: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap `inner`; consuming more than `max_message` bytes fails with
    /// [`HttpError::TooLarge`].
    pub fn new(inner: R, max_message: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK_BYTES),
            raw: Vec::new(),
            max_message,
        }
    }

    /// Bytes consumed so far.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Returns the consumed bytes and whatever was read past the message.
    pub fn into_parts(self) -> (Vec<u8>, BytesMut) {
        (self.raw, self.buf)
    }

    async fn fill(&mut self) -> Result<usize, HttpError> {
        self.buf.reserve(READ_CHUNK_BYTES);
        Ok(self.inner.read_buf(&mut self.buf).await?)
    }

    fn consume(&mut self, n: usize) -> Result<(), HttpError> {
        if self.raw.len() + n > self.max_message {
            return Err(HttpError::TooLarge { max: self.max_message });
        }
        self.raw.extend_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(())
    }

    /// Reads until `parse` recognises a complete head, then consumes it.
    ///
    /// `parse` returns the head length and the parsed value, or `None` while
    /// the head is still incomplete.
    pub async fn read_head<T, F>(&mut self, max_header: usize, mut parse: F) -> Result<T, HttpError>
    where
        F: FnMut(&[u8]) -> Result<Option<(usize, T)>, HttpError>,
    {
        loop {
            if !self.buf.is_empty() {
                if let Some((len, head)) = parse(&self.buf[..])? {
                    if len > max_header {
                        return Err(HttpError::HeaderTooLarge { max: max_header });
                    }
                    self.consume(len)?;
                    return Ok(head);
                }
                if self.buf.len() >= max_header {
                    return Err(HttpError::HeaderTooLarge { max: max_header });
                }
            }
            if self.fill().await? == 0 {
                return Err(if self.raw.is_empty() && self.buf.is_empty() {
                    HttpError::Closed
                } else {
                    HttpError::Incomplete
                });
            }
        }
    }

    /// Consumes a body delimited as `length` describes.
    pub async fn read_body(&mut self, length: BodyLength) -> Result<(), HttpError> {
        match length {
            BodyLength::Empty => Ok(()),
            BodyLength::Fixed(len) => self.read_exact(len).await,
            BodyLength::Chunked => self.read_chunked().await,
            BodyLength::UntilClose => self.read_to_close().await,
        }
    }

    async fn read_exact(&mut self, len: u64) -> Result<(), HttpError> {
        // Lengths come from the peer and may be anything up to u64::MAX.
        let fits = (self.raw.len() as u64)
            .checked_add(len)
            .is_some_and(|total| total <= self.max_message as u64);
        if !fits {
            return Err(HttpError::TooLarge { max: self.max_message });
        }
        let mut remaining = len as usize;
        loop {
            let take = remaining.min(self.buf.len());
            self.consume(take)?;
            remaining -= take;
            if remaining == 0 {
                return Ok(());
            }
            if self.fill().await? == 0 {
                return Err(HttpError::Incomplete);
            }
        }
    }

    async fn read_to_close(&mut self) -> Result<(), HttpError> {
        loop {
            let take = self.buf.len();
            self.consume(take)?;
            if self.fill().await? == 0 {
                return Ok(());
            }
        }
    }

    /// Consumes one line including its terminator and returns its content.
    async fn read_line(&mut self) -> Result<Vec<u8>, HttpError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf[..pos].strip_suffix(b"\r").unwrap_or(&self.buf[..pos]).to_vec();
                self.consume(pos + 1)?;
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE_BYTES {
                return Err(HttpError::Malformed("line too long"));
            }
            if self.fill().await? == 0 {
                return Err(HttpError::Incomplete);
            }
        }
    }

    async fn read_chunked(&mut self) -> Result<(), HttpError> {
        loop {
            let size_line = self.read_line().await?;
            let size = parse_chunk_size(&size_line)?;
            if size == 0 {
                // Trailer section ends with an empty line.
                while !self.read_line().await?.is_empty() {}
                return Ok(());
            }
            self.read_exact(size).await?;
            if !self.read_line().await?.is_empty() {
                return Err(HttpError::Malformed("missing CRLF after chunk data"));
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let line = std::str::from_utf8(line).map_err(|_| HttpError::Malformed("invalid chunk size"))?;
    let digits = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(digits, 16).map_err(|_| HttpError::Malformed("invalid chunk size"))
}
