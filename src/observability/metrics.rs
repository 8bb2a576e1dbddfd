//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_frames_total` (counter): frames on the link, by direction
//! - `proxy_exchanges_total` (counter): request/response exchanges, by side, kind, status
//! - `proxy_exchange_duration_seconds` (histogram): exchange latency, by side
//! - `proxy_tunnel_bytes_total` (counter): bytes bridged, by direction
//! - `proxy_link_reconnects_total` (counter): ship link re-dials, by result
//! - `proxy_active_connections` (gauge): open connections, by side

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Direction of a frame on the inter-proxy link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Sent,
    Received,
}

impl FrameDirection {
    fn as_str(self) -> &'static str {
        match self {
            FrameDirection::Sent => "sent",
            FrameDirection::Received => "received",
        }
    }
}

pub fn record_frame(direction: FrameDirection, bytes: usize) {
    metrics::counter!("proxy_frames_total", "direction" => direction.as_str()).increment(1);
    metrics::counter!("proxy_frame_bytes_total", "direction" => direction.as_str())
        .increment(bytes as u64);
}

/// Record a finished exchange. `kind` is "http" or "connect".
pub fn record_exchange(side: &'static str, kind: &'static str, status: u16, start: Instant) {
    metrics::counter!(
        "proxy_exchanges_total",
        "side" => side,
        "kind" => kind,
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("proxy_exchange_duration_seconds", "side" => side)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_tunnel_bytes(upstream: u64, downstream: u64) {
    metrics::counter!("proxy_tunnel_bytes_total", "direction" => "upstream").increment(upstream);
    metrics::counter!("proxy_tunnel_bytes_total", "direction" => "downstream").increment(downstream);
}

pub fn record_reconnect(success: bool) {
    let result = if success { "success" } else { "failure" };
    metrics::counter!("proxy_link_reconnects_total", "result" => result).increment(1);
}

pub fn set_active_connections(side: &'static str, count: u64) {
    metrics::gauge!("proxy_active_connections", "side" => side).set(count as f64);
}
