//! Authentication middleware

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::AppState;

/// Identity of the authenticated caller, injected into request extensions.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: String,
}

/// Require a valid bearer token on every MCP route.
///
/// The token is verified against the configured JWT secret; its `sub` claim
/// becomes the caller's user id for ownership checks downstream.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(header) if header.starts_with("Bearer ") => &header[7..],
        _ => {
            return unauthorized_response("Missing or invalid authorization header");
        }
    };

    let Some(claims) = state.auth.validate_token(token) else {
        return unauthorized_response("Invalid authentication token");
    };

    request.extensions_mut().insert(CurrentUser {
        user_id: claims.sub,
    });

    next.run(request).await
}

/// Create an unauthorized response
fn unauthorized_response(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "Unauthorized",
            "message": message
        })),
    )
        .into_response()
}
