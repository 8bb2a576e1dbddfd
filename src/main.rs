//! Ship/offshore forward proxy.
//!
//! ```text
//!   browser / curl                    restricted network  │  open network
//!        │                                                │
//!        ▼                                                │
//!   ┌──────────┐   one TCP link, [len32][payload] frames  │  ┌──────────────┐
//!   │   ship   │ ─────────────────────────────────────────┼─▶│   offshore   │──▶ origin
//!   │  :8080   │ ◀────────────────────────────────────────┼──│    :9090     │◀──
//!   └──────────┘   raw bytes while a CONNECT tunnel runs  │  └──────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use ship_proxy::config::loader::load_or_default;
use ship_proxy::config::{validate_config, ConfigError, ProxyConfig};
use ship_proxy::lifecycle::{run_offshore, run_ship};
use ship_proxy::observability::logging;
use ship_proxy::ProxyError;

#[derive(Debug, Parser)]
#[command(name = "ship-proxy", version, about = "Ship-to-offshore HTTP/HTTPS forward proxy")]
struct Cli {
    /// TOML configuration file; built-in defaults apply without one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level for this crate when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Accept local proxy clients and relay them to the offshore proxy
    Ship {
        /// Local listening port
        #[arg(long)]
        port: Option<u16>,
        /// Offshore proxy host
        #[arg(long)]
        offshore_host: Option<String>,
        /// Offshore proxy port
        #[arg(long)]
        offshore_port: Option<u16>,
    },
    /// Accept the ship link and fetch on its behalf
    Offshore {
        /// Listening port for the ship link
        #[arg(long)]
        port: Option<u16>,
    },
}

/// Layer command-line flags over the loaded configuration.
fn apply_overrides(config: &mut ProxyConfig, cli: &Cli) {
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }
    match &cli.role {
        Role::Ship {
            port,
            offshore_host,
            offshore_port,
        } => {
            if let Some(port) = port {
                config.ship.listen_address = replace_port(&config.ship.listen_address, *port);
            }
            if offshore_host.is_some() || offshore_port.is_some() {
                let (host, current_port) = split_host_port(&config.ship.offshore_address);
                let host = offshore_host.as_deref().unwrap_or(host);
                let port = offshore_port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| current_port.to_string());
                config.ship.offshore_address = join_host_port(host, &port);
            }
        }
        Role::Offshore { port } => {
            if let Some(port) = port {
                config.offshore.bind_address = replace_port(&config.offshore.bind_address, *port);
            }
        }
    }
}

fn split_host_port(address: &str) -> (&str, &str) {
    match address.rsplit_once(':') {
        Some((host, port)) => (host.trim_start_matches('[').trim_end_matches(']'), port),
        None => (address, ""),
    }
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn replace_port(address: &str, port: u16) -> String {
    join_host_port(split_host_port(address).0, &port.to_string())
}

fn load(cli: &Cli) -> Result<ProxyConfig, ConfigError> {
    let mut config = load_or_default(cli.config.as_deref())?;
    apply_overrides(&mut config, cli);
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load(&cli) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not configured yet.
            eprintln!("ship-proxy: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.observability.log_level);

    let result: Result<(), ProxyError> = match cli.role {
        Role::Ship { .. } => {
            tracing::info!(
                listen = %config.ship.listen_address,
                offshore = %config.ship.offshore_address,
                max_frame_bytes = config.link.max_frame_bytes,
                "ship-proxy starting in ship mode"
            );
            run_ship(config).await
        }
        Role::Offshore { .. } => {
            tracing::info!(
                bind = %config.offshore.bind_address,
                max_frame_bytes = config.link.max_frame_bytes,
                "ship-proxy starting in offshore mode"
            );
            run_offshore(config).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "ship-proxy exiting");
            ExitCode::FAILURE
        }
    }
}
