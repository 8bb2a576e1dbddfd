//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Check that listen addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field}: expected \"host:port\", got {value:?}")]
    InvalidHostPort { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("link.max_frame_bytes {0} does not fit a 32-bit length prefix")]
    FrameLimitTooLarge(usize),

    #[error("limits.max_header_bytes {header} exceeds link.max_frame_bytes {frame}")]
    HeaderLimitExceedsFrame { header: usize, frame: usize },

    #[error("reconnect.base_delay_ms {base} exceeds reconnect.max_delay_ms {max}")]
    BackoffInverted { base: u64, max: u64 },
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_socket_addr(&mut errors, "ship.listen_address", &config.ship.listen_address);
    check_socket_addr(&mut errors, "offshore.bind_address", &config.offshore.bind_address);
    check_host_port(&mut errors, "ship.offshore_address", &config.ship.offshore_address);
    if config.observability.metrics_enabled {
        check_socket_addr(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    let nonzero = [
        ("ship.max_connections", config.ship.max_connections as u64),
        ("offshore.max_connections", config.offshore.max_connections as u64),
        ("link.max_frame_bytes", config.link.max_frame_bytes as u64),
        ("limits.max_header_bytes", config.limits.max_header_bytes as u64),
        ("timeouts.connect_secs", config.timeouts.connect_secs),
        ("timeouts.request_secs", config.timeouts.request_secs),
        ("timeouts.idle_secs", config.timeouts.idle_secs),
    ];
    for (field, value) in nonzero {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if config.reconnect.enabled && config.reconnect.max_attempts == 0 {
        errors.push(ValidationError::Zero { field: "reconnect.max_attempts" });
    }

    if config.link.max_frame_bytes as u64 > u32::MAX as u64 {
        errors.push(ValidationError::FrameLimitTooLarge(config.link.max_frame_bytes));
    }

    if config.limits.max_header_bytes > config.link.max_frame_bytes {
        errors.push(ValidationError::HeaderLimitExceedsFrame {
            header: config.limits.max_header_bytes,
            frame: config.link.max_frame_bytes,
        });
    }

    if config.reconnect.base_delay_ms > config.reconnect.max_delay_ms {
        errors.push(ValidationError::BackoffInverted {
            base: config.reconnect.base_delay_ms,
            max: config.reconnect.max_delay_ms,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_socket_addr(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

// Hostnames are resolved at dial time, so only the shape is checked here.
fn check_host_port(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    let valid = match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if !valid {
        errors.push(ValidationError::InvalidHostPort {
            field,
            value: value.to_string(),
        });
    }
}
