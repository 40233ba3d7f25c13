//! Shared-token authentication middleware
//!
//! Every management endpoint except the health check requires the relay's
//! shared token, carried either in `X-Auth-Token` or as a bearer token.
//! A relay configured without a token runs the API open.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use std::sync::Arc;
use tracing::debug;

use crate::models::ErrorResponse;
use crate::ApiState;

fn unauthorized() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "Unauthorized".to_string(),
        }),
    )
}

/// Extract the token from `X-Auth-Token` or `Authorization: Bearer …`.
fn extract_token(request: &Request) -> Option<&str> {
    if let Some(token) = request
        .headers()
        .get("x-auth-token")
        .and_then(|v| v.to_str().ok())
    {
        return Some(token);
    }

    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub async fn require_token(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let Some(expected) = state.auth_token.as_deref() else {
        // Authentication disabled
        return Ok(next.run(request).await);
    };

    match extract_token(&request) {
        Some(token) if token == expected => Ok(next.run(request).await),
        _ => {
            debug!("Rejected API request with missing or invalid token");
            Err(unauthorized())
        }
    }
}
