//! Burrow relay server core
//!
//! Everything between a public socket and an agent's control channel: the
//! agent session state machine, the public HTTP/upgrade routers, raw TCP
//! tunnels, and the dynamic-port manager. The shared structures themselves
//! live in `burrow-control`; this crate owns the tasks that drive them.

pub mod dynamic;
pub mod http;
pub mod listener;
pub mod pages;
pub mod relay;
pub mod request;
pub mod response;
pub mod session;
pub mod tcp;
pub mod upgrade;
pub mod ws;

use burrow_control::{TunnelRegistry, VconnTable};
use dynamic::DynamicPortManager;
use std::sync::Arc;

/// Relay server configuration shared by every listener.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Base DNS domain for web tunnels (`<name>.<domain>`).
    pub domain: String,
    /// Default public HTTP port.
    pub http_port: u16,
    /// Dedicated agent control-channel port (legacy agents).
    pub ws_port: u16,
    /// Management API port; reserved from dynamic management.
    pub api_port: u16,
    /// Shared agent auth token. `None` disables authentication.
    pub auth_token: Option<String>,
}

/// Shared relay state handed to every task. The registry and table are
/// independently cloneable so collaborators (the management API) can hold
/// them without holding the whole relay.
pub struct RelayState {
    pub config: ServerConfig,
    pub tunnels: Arc<TunnelRegistry>,
    pub vconns: VconnTable,
    pub dynamic_ports: DynamicPortManager,
}

impl RelayState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            tunnels: Arc::new(TunnelRegistry::new()),
            vconns: VconnTable::new(),
            dynamic_ports: DynamicPortManager::new(),
        }
    }
}
