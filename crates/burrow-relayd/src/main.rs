//! Burrow relay daemon
//!
//! Wires the public listeners, the agent control listener, and the
//! management API together around one shared relay state, then runs until
//! interrupted.

mod config;

use anyhow::{Context, Result};
use burrow_api::{ApiServer, ApiServerConfig};
use burrow_server::listener::{run_control_listener, run_public_listener};
use burrow_server::{RelayState, ServerConfig};
use clap::Parser;
use config::RelayConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow - expose services behind NAT through a public relay
#[derive(Parser, Debug)]
#[command(name = "burrow-relayd")]
#[command(about = "Burrow reverse tunneling relay", long_about = r#"
Runs the public side of Burrow: agents behind NAT connect out to this
relay and register named tunnels; public clients reach them through
subdomains of the relay's base domain or through raw TCP ports.

EXAMPLES:
  # Local development, no authentication
  burrow-relayd --domain localhost --http-port 8080

  # Production behind a TLS-terminating proxy
  BURROW_AUTH_TOKEN=$TOKEN burrow-relayd --domain tunnel.example.com
"#)]
#[command(version)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(long, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    /// Base DNS domain for tunnels (e.g. tunnel.example.com)
    #[arg(long, env = "BURROW_DOMAIN")]
    domain: Option<String>,

    /// Public HTTP port
    #[arg(long, env = "BURROW_HTTP_PORT")]
    http_port: Option<u16>,

    /// Dedicated agent control-channel port
    #[arg(long, env = "BURROW_WS_PORT")]
    ws_port: Option<u16>,

    /// Management API port
    #[arg(long, env = "BURROW_API_PORT")]
    api_port: Option<u16>,

    /// Shared auth token for agents and the API; omit to disable auth
    #[arg(long, env = "BURROW_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    /// File settings, overridden by whatever was set via flag or env.
    fn resolve(self) -> Result<RelayConfig> {
        let mut config = RelayConfig::load(self.config.as_deref())?;
        if let Some(domain) = self.domain {
            config.domain = domain;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(port) = self.ws_port {
            config.ws_port = port;
        }
        if let Some(port) = self.api_port {
            config.api_port = port;
        }
        if let Some(token) = self.auth_token {
            config.auth_token = Some(token);
        }
        Ok(config)
    }
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let config = cli.resolve().context("Failed to resolve configuration")?;

    info!("Burrow relay starting");
    info!("Domain: {}", config.domain);
    info!("HTTP port: {}", config.http_port);
    info!("Control port: {}", config.ws_port);
    info!("API port: {}", config.api_port);
    if config.auth_token.is_none() {
        info!("Authentication disabled (no auth token configured)");
    }

    let state = Arc::new(RelayState::new(ServerConfig {
        domain: config.domain.clone(),
        http_port: config.http_port,
        ws_port: config.ws_port,
        api_port: config.api_port,
        auth_token: config.auth_token.clone(),
    }));

    let api = ApiServer::new(
        ApiServerConfig {
            bind_addr: ([0, 0, 0, 0], config.api_port).into(),
            domain: config.domain.clone(),
            auth_token: config.auth_token.clone(),
        },
        state.tunnels.clone(),
        state.vconns.clone(),
    );

    let mut public = tokio::spawn(run_public_listener(state.clone(), config.http_port));
    let mut control = tokio::spawn(run_control_listener(state.clone(), config.ws_port));
    let mut api_task = tokio::spawn(api.start());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = &mut public => {
            error!("Public listener exited: {:?}", result);
            anyhow::bail!("public listener exited unexpectedly");
        }
        result = &mut control => {
            error!("Control listener exited: {:?}", result);
            anyhow::bail!("control listener exited unexpectedly");
        }
        result = &mut api_task => {
            error!("API server exited: {:?}", result);
            anyhow::bail!("API server exited unexpectedly");
        }
    }

    public.abort();
    control.abort();
    api_task.abort();

    info!("Burrow relay stopped");
    Ok(())
}
