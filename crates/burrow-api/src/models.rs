//! JSON models for the management API

use burrow_control::{StatsSnapshot, Tunnel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Traffic counters for one tunnel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStats {
    pub requests: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl From<StatsSnapshot> for TunnelStats {
    fn from(snapshot: StatsSnapshot) -> Self {
        Self {
            requests: snapshot.requests,
            bytes_in: snapshot.bytes_in,
            bytes_out: snapshot.bytes_out,
        }
    }
}

/// One live tunnel as reported by the API
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub name: String,
    pub tunnel_type: String,
    pub protocol: String,
    pub target: String,
    pub target_port: u16,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub client_info: BTreeMap<String, String>,
    pub tcp_ports: Vec<u16>,
    pub stats: TunnelStats,
}

impl TunnelInfo {
    pub fn from_tunnel(tunnel: &Tunnel) -> Self {
        Self {
            name: tunnel.name.clone(),
            tunnel_type: tunnel.mode.as_str().to_string(),
            protocol: tunnel.protocol.clone(),
            target: tunnel.target_host.clone(),
            target_port: tunnel.target_port,
            connected_at: tunnel.connected_at,
            client_info: tunnel.client_info.clone(),
            tcp_ports: tunnel.tcp_ports(),
            stats: tunnel.stats.snapshot().into(),
        }
    }
}

/// Tunnel listing
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelList {
    pub tunnels: Vec<TunnelInfo>,
    pub count: usize,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    /// Seconds since the relay started
    pub uptime: u64,
    pub tunnels: usize,
    /// Resident set size in bytes, when the platform exposes it
    pub memory: Option<u64>,
    pub domain: String,
}

/// Aggregate counters across all tunnels
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub tunnels: usize,
    pub total_requests: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub active_connections: usize,
    pub uptime: u64,
}

/// Result of a write operation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

/// Error payload
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}
