use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use burrow_proto::{CommandAction, Frame};
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::*;
use crate::ApiState;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found(name: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Tunnel '{}' not found", name),
        }),
    )
}

/// Service health
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime: state.started_at.elapsed().as_secs(),
        tunnels: state.tunnels.count(),
        memory: read_rss_bytes(),
        domain: state.domain.clone(),
    })
}

/// List all live tunnels
#[utoipa::path(
    get,
    path = "/tunnels",
    responses(
        (status = 200, description = "Tunnel listing", body = TunnelList),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn list_tunnels(State(state): State<Arc<ApiState>>) -> Json<TunnelList> {
    debug!("Listing tunnels");

    let tunnels: Vec<TunnelInfo> = state
        .tunnels
        .list()
        .iter()
        .map(|tunnel| TunnelInfo::from_tunnel(tunnel))
        .collect();
    let count = tunnels.len();

    Json(TunnelList { tunnels, count })
}

/// Inspect a single tunnel
#[utoipa::path(
    get,
    path = "/tunnels/{name}",
    params(("name" = String, Path, description = "Tunnel name")),
    responses(
        (status = 200, description = "Tunnel details", body = TunnelInfo),
        (status = 404, description = "No such tunnel", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn get_tunnel(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<TunnelInfo>, ApiError> {
    let tunnel = state.tunnels.get(&name).ok_or_else(|| not_found(&name))?;
    Ok(Json(TunnelInfo::from_tunnel(&tunnel)))
}

/// Stop a tunnel: command the agent to stop, then drop its channel
#[utoipa::path(
    delete,
    path = "/tunnels/{name}",
    params(("name" = String, Path, description = "Tunnel name")),
    responses(
        (status = 200, description = "Stop command sent", body = ActionResponse),
        (status = 404, description = "No such tunnel", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn stop_tunnel(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    let tunnel = state.tunnels.get(&name).ok_or_else(|| not_found(&name))?;

    info!(tunnel = %name, "Stopping tunnel via API");
    let _ = tunnel
        .control
        .send(Frame::Command {
            action: CommandAction::Stop,
            reason: Some("Stopped via management API".to_string()),
        })
        .await;
    // Closing the channel triggers the session's teardown cascade
    tunnel.control.close().await;

    Ok(Json(ActionResponse {
        success: true,
        message: format!("Tunnel {} stopped", name),
    }))
}

/// Ask a tunnel's agent to restart; the control channel stays open
#[utoipa::path(
    post,
    path = "/tunnels/{name}/restart",
    params(("name" = String, Path, description = "Tunnel name")),
    responses(
        (status = 200, description = "Restart command sent", body = ActionResponse),
        (status = 404, description = "No such tunnel", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn restart_tunnel(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    let tunnel = state.tunnels.get(&name).ok_or_else(|| not_found(&name))?;

    info!(tunnel = %name, "Restarting tunnel via API");
    let _ = tunnel
        .control
        .send(Frame::Command {
            action: CommandAction::Restart,
            reason: Some("Restarted via management API".to_string()),
        })
        .await;

    Ok(Json(ActionResponse {
        success: true,
        message: format!("Tunnel {} restarting", name),
    }))
}

/// Aggregate counters
#[utoipa::path(
    get,
    path = "/stats",
    responses(
        (status = 200, description = "Aggregate counters", body = StatsResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    ),
    tag = "system"
)]
pub async fn stats(State(state): State<Arc<ApiState>>) -> Json<StatsResponse> {
    let tunnels = state.tunnels.list();
    let mut total_requests = 0;
    let mut total_bytes_in = 0;
    let mut total_bytes_out = 0;
    for tunnel in &tunnels {
        let snapshot = tunnel.stats.snapshot();
        total_requests += snapshot.requests;
        total_bytes_in += snapshot.bytes_in;
        total_bytes_out += snapshot.bytes_out;
    }

    Json(StatsResponse {
        tunnels: tunnels.len(),
        total_requests,
        total_bytes_in,
        total_bytes_out,
        active_connections: state.vconns.count(),
        uptime: state.started_at.elapsed().as_secs(),
    })
}

/// Resident set size of this process, best effort.
#[cfg(target_os = "linux")]
fn read_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn read_rss_bytes() -> Option<u64> {
    None
}
