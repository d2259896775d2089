//! HTTP router module
//!
//! Provides the REST API for MCP server lifecycle management under
//! `/api/mcp`. Every route requires a bearer token that validates against
//! the configured JWT secret.

mod middleware;
mod servers;

pub use middleware::CurrentUser;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::AuthManager;
use crate::docker::DockerManager;
use crate::registry::McpRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Server registry
    pub registry: Arc<McpRegistry>,

    /// Container supervisor
    pub docker: Arc<DockerManager>,

    /// Token manager
    pub auth: AuthManager,
}

/// Build the HTTP router with all routes
pub fn build_router(state: AppState) -> Router {
    let mcp_routes = Router::new()
        .route("/servers", get(servers::list_servers))
        .route("/servers", post(servers::create_server))
        .route("/servers/:server_id", get(servers::get_server))
        .route("/servers/:server_id", put(servers::update_server))
        .route("/servers/:server_id", delete(servers::delete_server))
        .route("/servers/:server_id/start", post(servers::start_server))
        .route("/servers/:server_id/stop", post(servers::stop_server))
        .route("/servers/:server_id/restart", post(servers::restart_server))
        .route("/servers/:server_id/status", get(servers::get_server_status))
        .route("/servers/:server_id/logs", get(servers::stream_server_logs))
        .route("/servers/:server_id/health", post(servers::check_server_health))
        .route(
            "/servers/:server_id/elicit/respond",
            post(servers::respond_to_elicitation),
        )
        // Apply auth middleware to all MCP routes
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    Router::new()
        .nest("/api/mcp", mcp_routes)
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Liveness probe for the control plane itself.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "ok"}))
}
