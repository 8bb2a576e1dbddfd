//! Top-level error returned by the proxy roles.

use thiserror::Error;

use crate::config::ConfigError;
use crate::net::ListenerError;
use crate::ship::LinkError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("invalid metrics address {0:?}")]
    MetricsAddress(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
