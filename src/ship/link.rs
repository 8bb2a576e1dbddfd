//! The ship's single inter-proxy link.
//!
//! # Responsibilities
//! - Own the one TCP connection to the offshore proxy
//! - Give one client at a time exclusive use of it (write a request frame,
//!   read the matching response frame)
//! - Hand the raw connection to a CONNECT tunnel and retire it afterwards
//! - Re-dial with exponential backoff after the link is lost
//!
//! # Design Decisions
//! - A single mutex covers the whole request/response pair, so responses
//!   come back in the order requests were written
//! - A link that carried a tunnel is never reused for frames
//! - When re-dialling gives up, every waiting and future client fails and
//!   the `failed` watch flips so the server can stop

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::config::{ProxyConfig, ReconnectConfig};
use crate::observability::metrics::{self, FrameDirection};
use crate::protocol::{bridge, BridgeOutcome, FrameCodec, FrameError};
use crate::resilience::{calculate_backoff, with_deadline};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to connect to offshore {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to offshore {address} timed out")]
    ConnectTimeout { address: String },

    #[error("inter-proxy link failed: {0}")]
    Frame(#[from] FrameError),

    #[error("inter-proxy link is down")]
    Down,
}

#[derive(Debug)]
enum LinkState {
    Connected(TcpStream),
    /// Carried a tunnel; frames need a fresh connection.
    Consumed,
    /// Broken by an I/O or framing error.
    Lost,
    /// Re-dialling gave up.
    Failed,
}

/// Shared handle to the inter-proxy link.
#[derive(Debug)]
pub struct ShipLink {
    offshore_address: String,
    codec: FrameCodec,
    connect_timeout: Duration,
    reconnect: ReconnectConfig,
    state: Mutex<LinkState>,
    failed: watch::Sender<bool>,
}

impl ShipLink {
    /// Dial the offshore proxy once. Failure here is fatal to the caller.
    pub async fn connect(config: &ProxyConfig) -> Result<Self, LinkError> {
        let mut link = Self {
            offshore_address: config.ship.offshore_address.clone(),
            codec: FrameCodec::new(config.link.max_frame_bytes),
            connect_timeout: config.timeouts.connect(),
            reconnect: config.reconnect.clone(),
            state: Mutex::new(LinkState::Lost),
            failed: watch::channel(false).0,
        };
        let stream = link.dial().await?;
        *link.state.get_mut() = LinkState::Connected(stream);

        tracing::info!(offshore = %link.offshore_address, "Inter-proxy link established");
        Ok(link)
    }

    pub fn offshore_address(&self) -> &str {
        &self.offshore_address
    }

    /// Flips to `true` once the link is permanently down.
    pub fn failed(&self) -> watch::Receiver<bool> {
        self.failed.subscribe()
    }

    /// Wait for exclusive use of a connected link.
    pub async fn acquire(&self) -> Result<LinkLease<'_>, LinkError> {
        let mut guard = self.state.lock().await;
        self.ensure_connected(&mut guard).await?;
        Ok(LinkLease { link: self, guard })
    }

    async fn dial(&self) -> Result<TcpStream, LinkError> {
        let address = &self.offshore_address;
        let stream = with_deadline(self.connect_timeout, TcpStream::connect(address.as_str()))
            .await
            .map_err(|_| LinkError::ConnectTimeout {
                address: address.clone(),
            })?
            .map_err(|source| LinkError::Connect {
                address: address.clone(),
                source,
            })?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    async fn ensure_connected(&self, state: &mut LinkState) -> Result<(), LinkError> {
        if let LinkState::Connected(stream) = state {
            match idle_link_fault(stream) {
                None => return Ok(()),
                Some(fault) => {
                    tracing::warn!(offshore = %self.offshore_address, fault, "Idle inter-proxy link is unusable");
                    *state = LinkState::Lost;
                }
            }
        }

        let attempts = match state {
            LinkState::Connected(_) => return Ok(()),
            LinkState::Failed => return Err(LinkError::Down),
            // Retiring a link after a tunnel is routine, so it is re-dialled
            // even when reconnecting after failures is disabled.
            LinkState::Consumed if !self.reconnect.enabled => 1,
            LinkState::Lost if !self.reconnect.enabled => 0,
            LinkState::Consumed | LinkState::Lost => self.reconnect.max_attempts,
        };

        for attempt in 0..attempts {
            let delay = calculate_backoff(
                attempt,
                self.reconnect.base_delay_ms,
                self.reconnect.max_delay_ms,
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.dial().await {
                Ok(stream) => {
                    metrics::record_reconnect(true);
                    tracing::info!(
                        offshore = %self.offshore_address,
                        attempt = attempt + 1,
                        "Inter-proxy link re-established"
                    );
                    *state = LinkState::Connected(stream);
                    return Ok(());
                }
                Err(e) => {
                    metrics::record_reconnect(false);
                    tracing::warn!(
                        offshore = %self.offshore_address,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Inter-proxy link re-dial failed"
                    );
                }
            }
        }

        *state = LinkState::Failed;
        self.failed.send_replace(true);
        tracing::error!(offshore = %self.offshore_address, "Inter-proxy link is permanently down");
        Err(LinkError::Down)
    }
}

/// Check an idle link without blocking.
///
/// The offshore never writes between exchanges, so anything readable here
/// (EOF, stray bytes or a socket error) means the link cannot carry a frame.
fn idle_link_fault(stream: &TcpStream) -> Option<&'static str> {
    let mut byte = [0u8; 1];
    match stream.try_read(&mut byte) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
        Ok(0) => Some("closed by offshore"),
        Ok(_) => Some("unsolicited bytes"),
        Err(_) => Some("socket error"),
    }
}

/// Exclusive use of a connected link, released on drop.
#[derive(Debug)]
pub struct LinkLease<'a> {
    link: &'a ShipLink,
    guard: MutexGuard<'a, LinkState>,
}

impl LinkLease<'_> {
    fn stream(&mut self) -> Result<&mut TcpStream, LinkError> {
        match &mut *self.guard {
            LinkState::Connected(stream) => Ok(stream),
            _ => Err(LinkError::Down),
        }
    }

    fn mark_lost(&mut self, error: &FrameError) {
        tracing::error!(offshore = %self.link.offshore_address, error = %error, "Inter-proxy link lost");
        *self.guard = LinkState::Lost;
    }

    /// Write one request frame and read the response frame that answers it.
    pub async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, LinkError> {
        let codec = self.link.codec;
        let stream = self.stream()?;

        if let Err(e) = codec.write_frame(stream, request).await {
            // An oversize payload is refused before anything is written.
            if !matches!(e, FrameError::TooLarge { .. }) {
                self.mark_lost(&e);
            }
            return Err(e.into());
        }
        metrics::record_frame(FrameDirection::Sent, request.len());

        let stream = self.stream()?;
        match codec.read_frame(stream).await {
            Ok(response) => {
                metrics::record_frame(FrameDirection::Received, response.len());
                Ok(response)
            }
            Err(e) => {
                self.mark_lost(&e);
                Err(e.into())
            }
        }
    }

    /// Bridge `client` with the raw link until either side ends.
    ///
    /// `early_data` is tunnel payload the client sent along with its
    /// CONNECT request. The link is retired afterwards.
    pub async fn tunnel<C>(
        mut self,
        client: C,
        early_data: &[u8],
        idle: Duration,
    ) -> Result<BridgeOutcome, LinkError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self.stream()?;
        if !early_data.is_empty() {
            if let Err(e) = stream.write_all(early_data).await {
                let e = FrameError::Io(e);
                self.mark_lost(&e);
                return Err(e.into());
            }
        }

        let outcome = bridge(client, &mut *stream, idle).await;
        self.retire();
        Ok(outcome)
    }

    /// Stop using this connection for frames.
    ///
    /// Used when the offshore has switched to raw bridging but the tunnel
    /// never started on this side.
    pub fn retire(mut self) {
        *self.guard = LinkState::Consumed;
    }
}
