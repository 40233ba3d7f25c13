//! Burrow management API
//!
//! REST surface over the relay's in-memory state: list and inspect live
//! tunnels, stop or restart them through their control channels, and read
//! aggregate counters. Reads come straight from the registry; writes go
//! out as `command` frames.

pub mod handlers;
pub mod middleware;
pub mod models;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Json, Router,
};
use burrow_control::{TunnelRegistry, VconnTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

/// Application state shared across handlers
pub struct ApiState {
    pub tunnels: Arc<TunnelRegistry>,
    pub vconns: VconnTable,
    pub domain: String,
    /// Shared management token; `None` runs the API open.
    pub auth_token: Option<String>,
    pub started_at: Instant,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Burrow Management API",
        description = "Management surface for the Burrow reverse tunneling relay"
    ),
    paths(
        handlers::health,
        handlers::list_tunnels,
        handlers::get_tunnel,
        handlers::stop_tunnel,
        handlers::restart_tunnel,
        handlers::stats,
    ),
    components(schemas(
        models::TunnelStats,
        models::TunnelInfo,
        models::TunnelList,
        models::HealthResponse,
        models::StatsResponse,
        models::ActionResponse,
        models::ErrorResponse,
    )),
    tags(
        (name = "tunnels", description = "Tunnel management endpoints"),
        (name = "system", description = "Health and aggregate counters")
    )
)]
struct ApiDoc;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: SocketAddr,
    pub domain: String,
    pub auth_token: Option<String>,
}

/// Management API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, tunnels: Arc<TunnelRegistry>, vconns: VconnTable) -> Self {
        let state = Arc::new(ApiState {
            tunnels,
            vconns,
            domain: config.domain.clone(),
            auth_token: config.auth_token.clone(),
            started_at: Instant::now(),
        });
        Self { config, state }
    }

    /// Build the router with all routes and layers.
    pub fn build_router(&self) -> Router {
        // Health and the OpenAPI document stay reachable without a token
        let public = Router::new()
            .route("/health", get(handlers::health))
            .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
            .with_state(self.state.clone());

        let protected = Router::new()
            .route("/tunnels", get(handlers::list_tunnels))
            .route(
                "/tunnels/{name}",
                get(handlers::get_tunnel).delete(handlers::stop_tunnel),
            )
            .route("/tunnels/{name}/restart", post(handlers::restart_tunnel))
            .route("/stats", get(handlers::stats))
            .layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                middleware::require_token,
            ))
            .with_state(self.state.clone());

        // Open CORS: the dashboard may be served from anywhere
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        public
            .merge(protected)
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until the process exits.
    pub async fn start(self) -> std::io::Result<()> {
        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("Management API listening on http://{}", self.config.bind_addr);
        axum::serve(listener, router).await
    }
}
