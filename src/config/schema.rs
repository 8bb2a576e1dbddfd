//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for both proxy
//! roles. All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration shared by the ship and offshore processes.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Ship-side listener and inter-proxy link target.
    pub ship: ShipConfig,

    /// Offshore-side listener.
    pub offshore: OffshoreConfig,

    /// Inter-proxy link framing.
    pub link: LinkConfig,

    /// HTTP message limits.
    pub limits: LimitsConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Link reconnect policy (ship side).
    pub reconnect: ReconnectConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Ship proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShipConfig {
    /// Address local HTTP clients connect to (e.g., "0.0.0.0:8080").
    pub listen_address: String,

    /// Offshore proxy address as "host:port". Resolved by the OS resolver.
    pub offshore_address: String,

    /// Maximum concurrent client connections (backpressure).
    pub max_connections: usize,
}

impl Default for ShipConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            offshore_address: "offshore:9090".to_string(),
            max_connections: 1024,
        }
    }
}

/// Offshore proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OffshoreConfig {
    /// Address ship proxies connect to (e.g., "0.0.0.0:9090").
    pub bind_address: String,

    /// Maximum concurrent ship links.
    pub max_connections: usize,
}

impl Default for OffshoreConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9090".to_string(),
            max_connections: 64,
        }
    }
}

/// Inter-proxy link configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Largest frame payload accepted or emitted, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024, // 16 MiB
        }
    }
}

/// Limits applied while reading HTTP messages.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum size of a request or response header block, in bytes.
    pub max_header_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Target dial timeout in seconds.
    pub connect_secs: u64,

    /// Time allowed for an origin to deliver a complete response, in seconds.
    pub request_secs: u64,

    /// Idle timeout for CONNECT tunnels in seconds.
    pub idle_secs: u64,

    /// Grace period for draining connections on shutdown, in seconds.
    pub shutdown_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
            idle_secs: 300,
            shutdown_secs: 10,
        }
    }
}

/// Reconnect policy for the ship's inter-proxy link.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Re-dial the offshore after the link is lost.
    pub enabled: bool,

    /// Maximum dial attempts per reconnect.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9100".to_string(),
        }
    }
}
