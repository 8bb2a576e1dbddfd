//! One inter-proxy link as seen from the offshore side.
//!
//! # Responsibilities
//! - Read request frames off the link one at a time
//! - Fetch each request from its origin and frame the response back
//! - Switch the link to raw bridging for a CONNECT; the link is spent
//!   once the tunnel ends
//!
//! Failures that concern a single request are answered with an error
//! response frame; only link-level failures end the session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::http::{
    error_response, read_response, HttpError, OriginResponse, RequestHead, Target,
    CONNECTION_ESTABLISHED,
};
use crate::lifecycle::shutdown;
use crate::net::ConnectionId;
use crate::observability::metrics::{self, FrameDirection};
use crate::protocol::{bridge, FrameCodec, FrameError};
use crate::resilience::{connect_with_timeout, with_deadline, DialError};

const SIDE: &str = "offshore";

/// Limits and timeouts shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub codec: FrameCodec,
    pub max_header_bytes: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

impl From<&ProxyConfig> for SessionSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            codec: FrameCodec::new(config.link.max_frame_bytes),
            max_header_bytes: config.limits.max_header_bytes,
            connect_timeout: config.timeouts.connect(),
            request_timeout: config.timeouts.request(),
            idle_timeout: config.timeouts.idle(),
        }
    }
}

fn dial_status(error: &DialError) -> StatusCode {
    match error {
        DialError::Refused { .. } => StatusCode::BAD_GATEWAY,
        DialError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
    }
}

/// What the link can carry after an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// More frames.
    Continue,
    /// Nothing more; it carried a tunnel.
    Consumed,
}

/// A session owns its link socket for its whole life.
pub struct LinkSession {
    link: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    settings: Arc<SessionSettings>,
}

impl LinkSession {
    pub fn new(
        link: TcpStream,
        peer: SocketAddr,
        id: ConnectionId,
        settings: Arc<SessionSettings>,
    ) -> Self {
        Self {
            link,
            peer,
            id,
            settings,
        }
    }

    /// Serve frames until the ship closes the link or shutdown is signalled.
    ///
    /// Shutdown is only observed between exchanges.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), FrameError> {
        tracing::info!(connection_id = %self.id, peer = %self.peer, "Ship link session started");
        let codec = self.settings.codec;

        loop {
            let payload = tokio::select! {
                frame = codec.read_frame(&mut self.link) => match frame {
                    Ok(payload) => payload,
                    Err(FrameError::Closed) => {
                        tracing::info!(connection_id = %self.id, "Ship closed the link");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
                _ = shutdown::recv(&mut shutdown) => {
                    tracing::info!(connection_id = %self.id, "Link session stopping for shutdown");
                    return Ok(());
                }
            };
            metrics::record_frame(FrameDirection::Received, payload.len());
            if self.handle_frame(&payload).await? == Flow::Consumed {
                self.discard_until_closed().await;
                return Ok(());
            }
        }
    }

    /// A link that carried a tunnel has no frame boundary left to find.
    /// Whatever the ship still sends is tunnel residue.
    async fn discard_until_closed(&mut self) {
        let drained = with_deadline(
            self.settings.idle_timeout,
            tokio::io::copy(&mut self.link, &mut tokio::io::sink()),
        )
        .await;
        match drained {
            Ok(Ok(0)) => tracing::info!(connection_id = %self.id, "Ship closed the link after tunnel"),
            Ok(Ok(n)) => tracing::debug!(connection_id = %self.id, discarded = n, "Discarded tunnel residue"),
            Ok(Err(e)) => tracing::debug!(connection_id = %self.id, error = %e, "Link failed after tunnel"),
            Err(_) => tracing::warn!(connection_id = %self.id, "Ship kept the link open after tunnel"),
        }
    }

    async fn handle_frame(&mut self, payload: &[u8]) -> Result<Flow, FrameError> {
        let start = Instant::now();
        let exchange_id = Uuid::new_v4();

        let head = match RequestHead::parse(payload) {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!(exchange_id = %exchange_id, bytes = payload.len(), error = %e, "Unparseable request frame");
                self.reply_error(StatusCode::BAD_REQUEST, "http", start).await?;
                return Ok(Flow::Continue);
            }
        };
        let kind = if head.is_connect() { "connect" } else { "http" };
        let target = match head.resolve_target() {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(exchange_id = %exchange_id, target = %head.target, error = %e, "Unroutable request");
                self.reply_error(StatusCode::BAD_REQUEST, kind, start).await?;
                return Ok(Flow::Continue);
            }
        };
        tracing::debug!(
            exchange_id = %exchange_id,
            connection_id = %self.id,
            method = %head.method,
            origin = %target,
            "Handling request frame"
        );

        let origin = match connect_with_timeout(&target, self.settings.connect_timeout).await {
            Ok(origin) => origin,
            Err(e) => {
                tracing::warn!(exchange_id = %exchange_id, error = %e, "Origin dial failed");
                self.reply_error(dial_status(&e), kind, start).await?;
                return Ok(Flow::Continue);
            }
        };

        if head.is_connect() {
            self.tunnel(origin, &target, exchange_id, start).await?;
            Ok(Flow::Consumed)
        } else {
            self.forward(origin, &head, payload, exchange_id, start).await?;
            Ok(Flow::Continue)
        }
    }

    async fn forward(
        &mut self,
        mut origin: TcpStream,
        head: &RequestHead,
        payload: &[u8],
        exchange_id: Uuid,
        start: Instant,
    ) -> Result<(), FrameError> {
        let fetched = with_deadline(
            self.settings.request_timeout,
            fetch(&mut origin, payload, head.is_head(), self.limits()),
        )
        .await;
        drop(origin);

        let response = match fetched {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!(exchange_id = %exchange_id, error = %e, "Origin exchange failed");
                return self.reply_error(StatusCode::BAD_GATEWAY, "http", start).await;
            }
            Err(e) => {
                tracing::warn!(exchange_id = %exchange_id, error = %e, "Origin response timed out");
                return self.reply_error(StatusCode::GATEWAY_TIMEOUT, "http", start).await;
            }
        };

        self.send(&response.raw).await?;
        metrics::record_exchange(SIDE, "http", response.status.as_u16(), start);
        tracing::debug!(
            exchange_id = %exchange_id,
            status = response.status.as_u16(),
            bytes = response.raw.len(),
            "Response framed to ship"
        );
        Ok(())
    }

    async fn tunnel(
        &mut self,
        origin: TcpStream,
        target: &Target,
        exchange_id: Uuid,
        start: Instant,
    ) -> Result<(), FrameError> {
        self.send(CONNECTION_ESTABLISHED).await?;
        tracing::info!(exchange_id = %exchange_id, origin = %target, "Tunnel established");

        let outcome = bridge(&mut self.link, origin, self.settings.idle_timeout).await;
        metrics::record_tunnel_bytes(outcome.a_to_b, outcome.b_to_a);
        metrics::record_exchange(SIDE, "connect", StatusCode::OK.as_u16(), start);
        tracing::info!(
            exchange_id = %exchange_id,
            upstream = outcome.a_to_b,
            downstream = outcome.b_to_a,
            end = ?outcome.end,
            "Tunnel closed"
        );
        Ok(())
    }

    /// (max header, max message) for origin responses.
    fn limits(&self) -> (usize, usize) {
        (
            self.settings.max_header_bytes,
            self.settings.codec.max_frame_bytes(),
        )
    }

    async fn reply_error(
        &mut self,
        status: StatusCode,
        kind: &'static str,
        start: Instant,
    ) -> Result<(), FrameError> {
        self.send(&error_response(status)).await?;
        metrics::record_exchange(SIDE, kind, status.as_u16(), start);
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        self.settings.codec.write_frame(&mut self.link, payload).await?;
        metrics::record_frame(FrameDirection::Sent, payload.len());
        Ok(())
    }
}

/// Write a request to its origin and read back one full response.
async fn fetch(
    origin: &mut TcpStream,
    request: &[u8],
    request_is_head: bool,
    (max_header, max_message): (usize, usize),
) -> Result<OriginResponse, HttpError> {
    origin.write_all(request).await?;
    origin.flush().await?;
    read_response(origin, request_is_head, max_header, max_message).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn session_pair() -> (TcpStream, FrameCodec) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ship = TcpStream::connect(addr).await.unwrap();
        let (link, peer) = listener.accept().await.unwrap();

        let mut config = ProxyConfig::default();
        config.timeouts.request_secs = 2;
        let settings = Arc::new(SessionSettings::from(&config));
        let (shutdown, rx) = broadcast::channel::<()>(1);
        tokio::spawn(async move {
            // Dropping the sender would read as a shutdown.
            let _shutdown = shutdown;
            LinkSession::new(link, peer, ConnectionId::new(), settings).run(rx).await
        });
        (ship, FrameCodec::default())
    }

    async fn origin_replying(reply: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(reply).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn garbage_frame_gets_400_and_session_continues() {
        let (mut ship, codec) = session_pair().await;

        codec.write_frame(&mut ship, b"").await.unwrap();
        let reply = codec.read_frame(&mut ship).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));

        codec.write_frame(&mut ship, b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let reply = codec.read_frame(&mut ship).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 400 "));
    }

    #[tokio::test]
    async fn response_is_framed_verbatim() {
        let wire: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-Origin: yes\r\n\r\nok";
        let origin = origin_replying(wire).await;
        let (mut ship, codec) = session_pair().await;

        let request = format!("GET / HTTP/1.1\r\nHost: {origin}\r\n\r\n");
        codec.write_frame(&mut ship, request.as_bytes()).await.unwrap();
        assert_eq!(codec.read_frame(&mut ship).await.unwrap(), wire);
    }

    #[tokio::test]
    async fn unreachable_origin_is_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (mut ship, codec) = session_pair().await;

        let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n");
        codec.write_frame(&mut ship, request.as_bytes()).await.unwrap();
        let reply = codec.read_frame(&mut ship).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
    }

    #[tokio::test]
    async fn origin_closing_mid_response_is_502() {
        let origin = origin_replying(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort").await;
        let (mut ship, codec) = session_pair().await;

        let request = format!("GET / HTTP/1.1\r\nHost: {origin}\r\n\r\n");
        codec.write_frame(&mut ship, request.as_bytes()).await.unwrap();
        let reply = codec.read_frame(&mut ship).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 502 "));
    }

    #[tokio::test]
    async fn connect_switches_link_to_raw_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });
        let (mut ship, codec) = session_pair().await;

        let request = format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
        codec.write_frame(&mut ship, request.as_bytes()).await.unwrap();
        assert_eq!(codec.read_frame(&mut ship).await.unwrap(), CONNECTION_ESTABLISHED);

        ship.write_all(b"ping").await.unwrap();
        let mut echoed = Vec::new();
        ship.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"ping");
    }
}
