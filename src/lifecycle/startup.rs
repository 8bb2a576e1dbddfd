//! Startup orchestration.
//!
//! # Responsibilities
//! - Start the metrics exporter when enabled
//! - Bind the role's listener and, for the ship, dial the offshore proxy
//! - Run until a signal arrives or the role fails, then drain
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The listener binds before the link is dialled so a port clash is
//!   reported first
//! - The configuration is validated by the caller

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals;
use crate::net::{ConnectionTracker, Listener};
use crate::observability::metrics;
use crate::offshore::OffshoreServer;
use crate::ship::ShipServer;

/// Run the ship proxy until shutdown or a permanent link failure.
pub async fn run_ship(config: ProxyConfig) -> Result<(), ProxyError> {
    start_metrics(&config)?;

    let listener = Listener::bind(&config.ship.listen_address, config.ship.max_connections).await?;
    let server = ShipServer::connect(&config).await?;

    let shutdown = Shutdown::new();
    let tracker = server.tracker();
    let serving = server.run(listener, shutdown.subscribe());
    serve(serving, &shutdown, tracker, config.timeouts.shutdown(), signals::wait_for_signal()).await
}

/// Run the offshore proxy until shutdown.
pub async fn run_offshore(config: ProxyConfig) -> Result<(), ProxyError> {
    start_metrics(&config)?;

    let listener =
        Listener::bind(&config.offshore.bind_address, config.offshore.max_connections).await?;
    let server = OffshoreServer::new(&config);

    let shutdown = Shutdown::new();
    let tracker = server.tracker();
    let serving = server.run(listener, shutdown.subscribe());
    serve(serving, &shutdown, tracker, config.timeouts.shutdown(), signals::wait_for_signal()).await
}

fn start_metrics(config: &ProxyConfig) -> Result<(), ProxyError> {
    if !config.observability.metrics_enabled {
        return Ok(());
    }
    let addr: SocketAddr = config
        .observability
        .metrics_address
        .parse()
        .map_err(|_| ProxyError::MetricsAddress(config.observability.metrics_address.clone()))?;
    metrics::init_metrics(addr)?;
    Ok(())
}

/// Drive `serving` until `stop` resolves, then stop accepting and wait up
/// to `grace` for open connections.
///
/// If `serving` ends on its own, its result is returned without draining.
pub async fn serve<S, F>(
    serving: S,
    shutdown: &Shutdown,
    tracker: ConnectionTracker,
    grace: Duration,
    stop: F,
) -> Result<(), ProxyError>
where
    S: Future<Output = Result<(), ProxyError>>,
    F: Future<Output = ()>,
{
    tokio::pin!(serving);
    tokio::select! {
        result = &mut serving => {
            shutdown.trigger();
            return result;
        }
        _ = stop => {}
    }

    tracing::info!(
        active_connections = tracker.active_count(),
        subscribers = shutdown.receiver_count(),
        grace_secs = grace.as_secs(),
        "Graceful shutdown started"
    );
    shutdown.trigger();
    serving.await?;

    if !tracker.wait_for_drain(grace).await {
        tracing::warn!(
            remaining = tracker.active_count(),
            "Grace period elapsed with connections still open"
        );
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
