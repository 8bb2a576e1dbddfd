//! Client-facing side of the ship proxy.
//!
//! # Responsibilities
//! - Accept local HTTP clients on the ship listener
//! - Answer unreadable, oversized or stalled requests locally (400/408/413/431)
//! - Carry each request over the shared link and relay the reply verbatim
//! - Turn a successful CONNECT into a tunnel over the link
//!
//! Each client connection carries one exchange and is then closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::response::status_of;
use crate::http::{error_response, read_request, HttpError};
use crate::lifecycle::shutdown;
use crate::net::{ConnectionId, ConnectionTracker, Listener};
use crate::observability::metrics;
use crate::resilience::with_deadline;
use crate::ship::link::{LinkError, ShipLink};

const SIDE: &str = "ship";

/// Per-client limits, shared by every client task.
#[derive(Debug, Clone)]
struct ClientSettings {
    max_header_bytes: usize,
    max_message_bytes: usize,
    /// Deadline for a client to deliver its whole request.
    request_timeout: Duration,
    idle_timeout: Duration,
}

impl From<&ProxyConfig> for ClientSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_header_bytes: config.limits.max_header_bytes,
            max_message_bytes: config.link.max_frame_bytes,
            request_timeout: config.timeouts.request(),
            idle_timeout: config.timeouts.idle(),
        }
    }
}

/// The ship proxy: local listener plus the link to the offshore proxy.
pub struct ShipServer {
    link: Arc<ShipLink>,
    settings: Arc<ClientSettings>,
    tracker: ConnectionTracker,
}

impl ShipServer {
    pub fn new(config: &ProxyConfig, link: ShipLink) -> Self {
        Self {
            link: Arc::new(link),
            settings: Arc::new(ClientSettings::from(config)),
            tracker: ConnectionTracker::new(SIDE),
        }
    }

    /// Establish the link to the offshore proxy and build the server.
    pub async fn connect(config: &ProxyConfig) -> Result<Self, LinkError> {
        let link = ShipLink::connect(config).await?;
        Ok(Self::new(config, link))
    }

    /// Tracker for the client connections this server spawns.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept clients until shutdown, or until the link is permanently down.
    ///
    /// A permanently failed link is returned as an error so the process can
    /// exit non-zero.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ProxyError> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            offshore = %self.link.offshore_address(),
            "Ship proxy accepting clients"
        );

        let mut failed = self.link.failed();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept client");
                            continue;
                        }
                    };
                    let guard = self.tracker.track();
                    let link = Arc::clone(&self.link);
                    let settings = Arc::clone(&self.settings);
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_client(stream, peer, guard.id(), &link, &settings).await;
                    });
                }
                changed = failed.changed() => {
                    if changed.is_err() || *failed.borrow() {
                        tracing::error!("Ship proxy stopping: inter-proxy link is down");
                        return Err(LinkError::Down.into());
                    }
                }
                _ = shutdown::recv(&mut shutdown) => {
                    tracing::info!("Ship proxy stopped accepting clients");
                    return Ok(());
                }
            }
        }
    }
}

/// Serve one client connection: one request, one response, then close.
async fn handle_client(
    mut client: TcpStream,
    peer: SocketAddr,
    connection_id: ConnectionId,
    link: &ShipLink,
    settings: &ClientSettings,
) {
    let start = Instant::now();
    let read = read_request(
        &mut client,
        settings.max_header_bytes,
        settings.max_message_bytes,
    );
    let request = match with_deadline(settings.request_timeout, read).await {
        Ok(Ok(request)) => request,
        Err(timed_out) => {
            tracing::debug!(connection_id = %connection_id, %peer, error = %timed_out, "Client request incomplete");
            let status = StatusCode::REQUEST_TIMEOUT;
            reply_and_close(&mut client, &error_response(status)).await;
            metrics::record_exchange(SIDE, "http", status.as_u16(), start);
            return;
        }
        Ok(Err(HttpError::Closed)) => {
            tracing::trace!(connection_id = %connection_id, %peer, "Client closed without a request");
            return;
        }
        Ok(Err(e)) => {
            let status = e.client_status();
            tracing::warn!(
                connection_id = %connection_id,
                %peer,
                status = status.as_u16(),
                error = %e,
                "Rejecting client request"
            );
            reply_and_close(&mut client, &error_response(status)).await;
            metrics::record_exchange(SIDE, "http", status.as_u16(), start);
            return;
        }
    };

    let exchange_id = Uuid::new_v4();
    let is_connect = request.head.is_connect();
    let kind = if is_connect { "connect" } else { "http" };
    tracing::debug!(
        exchange_id = %exchange_id,
        connection_id = %connection_id,
        method = %request.head.method,
        target = %request.head.target,
        bytes = request.raw.len(),
        "Forwarding request over link"
    );

    let mut lease = match link.acquire().await {
        Ok(lease) => lease,
        Err(e) => {
            tracing::warn!(exchange_id = %exchange_id, error = %e, "Dropping client: link unavailable");
            return;
        }
    };
    let response = match lease.exchange(&request.raw).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(exchange_id = %exchange_id, error = %e, "Exchange over link failed");
            return;
        }
    };
    let status = status_of(&response).map(|s| s.as_u16()).unwrap_or(0);

    if is_connect && (200..300).contains(&status) {
        if let Err(e) = client.write_all(&response).await {
            tracing::debug!(exchange_id = %exchange_id, error = %e, "Client left before tunnel start");
            lease.retire();
            return;
        }
        tracing::info!(exchange_id = %exchange_id, target = %request.head.target, "Tunnel established");

        match lease
            .tunnel(&mut client, &request.early_data, settings.idle_timeout)
            .await
        {
            Ok(outcome) => {
                metrics::record_tunnel_bytes(outcome.a_to_b, outcome.b_to_a);
                tracing::info!(
                    exchange_id = %exchange_id,
                    upstream = outcome.a_to_b,
                    downstream = outcome.b_to_a,
                    end = ?outcome.end,
                    "Tunnel closed"
                );
            }
            Err(e) => {
                tracing::warn!(exchange_id = %exchange_id, error = %e, "Tunnel failed to start");
            }
        }
    } else {
        // Release the link before writing to a possibly slow client.
        drop(lease);
        reply_and_close(&mut client, &response).await;
    }

    metrics::record_exchange(SIDE, kind, status, start);
    tracing::debug!(
        exchange_id = %exchange_id,
        status,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Exchange complete"
    );
}

async fn reply_and_close(client: &mut TcpStream, bytes: &[u8]) {
    let written = async {
        client.write_all(bytes).await?;
        client.shutdown().await
    };
    if let Err(e) = written.await {
        tracing::debug!(error = %e, "Failed to write response to client");
    }
}
