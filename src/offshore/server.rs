//! Offshore accept loop: one [`LinkSession`] per ship connection.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::lifecycle::shutdown;
use crate::net::{ConnectionTracker, Listener};
use crate::offshore::session::{LinkSession, SessionSettings};

pub struct OffshoreServer {
    settings: Arc<SessionSettings>,
    tracker: ConnectionTracker,
}

impl OffshoreServer {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            settings: Arc::new(SessionSettings::from(config)),
            tracker: ConnectionTracker::new("offshore"),
        }
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept ship links until shutdown.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ProxyError> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Offshore proxy accepting ship links");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept ship link");
                            continue;
                        }
                    };

                    let guard = self.tracker.track();
                    let session = LinkSession::new(stream, peer, guard.id(), Arc::clone(&self.settings));
                    let session_shutdown = shutdown.resubscribe();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let id = guard.id();
                        if let Err(e) = session.run(session_shutdown).await {
                            tracing::warn!(connection_id = %id, error = %e, "Ship link session ended with error");
                        }
                    });
                }
                _ = shutdown::recv(&mut shutdown) => {
                    tracing::info!("Offshore proxy stopped accepting ship links");
                    return Ok(());
                }
            }
        }
    }
}
