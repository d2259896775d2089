//! MCP server lifecycle handlers
//!
//! Glue between the registry, the container supervisor, and the token
//! manager. Handlers enforce ownership and state preconditions, sequence
//! the service calls, and persist resulting statuses back through the
//! registry.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::header::{HeaderName, CACHE_CONTROL},
    response::sse::{Event, Sse},
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::warn;

use crate::docker::DEFAULT_STOP_TIMEOUT;
use crate::error::ApiError;
use crate::models::{
    ElicitationResponse, McpServer, McpServerCreate, McpServerList, McpServerStatus,
    McpServerUpdate, ServerActionResponse, ServerStatus,
};

use super::{AppState, CurrentUser};

/// Environment key carrying the rotated access token into containers.
const TOKEN_ENV_KEY: &str = "SUPABASE_JWT_SECRET";

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub status: Option<ServerStatus>,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_follow")]
    pub follow: bool,
    #[serde(default = "default_tail")]
    pub tail: u32,
}

fn default_follow() -> bool {
    true
}

fn default_tail() -> u32 {
    100
}

/// Fetch a server and enforce that the caller owns it.
async fn fetch_owned(
    state: &AppState,
    server_id: &str,
    user: &CurrentUser,
) -> Result<McpServer, ApiError> {
    let server = state
        .registry
        .get(server_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound("Server not found".to_string()))?;

    if server.created_by != user.user_id {
        return Err(ApiError::Forbidden("Access denied".to_string()));
    }

    Ok(server)
}

/// List the caller's servers, optionally filtered by status.
pub async fn list_servers(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<ListQuery>,
) -> Result<Json<McpServerList>, ApiError> {
    if query.page < 1 {
        return Err(ApiError::Validation("page must be >= 1".to_string()));
    }
    if !(1..=100).contains(&query.page_size) {
        return Err(ApiError::Validation(
            "page_size must be in [1, 100]".to_string(),
        ));
    }

    let list = state
        .registry
        .list(Some(&user.user_id), query.status, query.page, query.page_size)
        .await?;

    Ok(Json(list))
}

/// Create a server: register it, then materialise the container.
///
/// When the supervisor reports an error the registry record is rolled back
/// and the runtime's message surfaces as a 500.
pub async fn create_server(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(create): Json<McpServerCreate>,
) -> Result<Json<McpServer>, ApiError> {
    let server = state.registry.register(create, &user.user_id).await?;

    let mut status = state.docker.create_container(&server.id, &server.config).await;

    if status.status == ServerStatus::Error {
        let message = status
            .error_message
            .unwrap_or_else(|| "Failed to create container".to_string());
        if let Err(e) = state.registry.delete(&server.id).await {
            warn!("Failed to roll back registry record {}: {}", server.id, e);
        }
        return Err(ApiError::internal(message));
    }

    status.server_id = server.id.clone();
    state.registry.update_status(&server.id, &status).await?;

    let server = state
        .registry
        .get(&server.id)
        .await?
        .ok_or_else(|| ApiError::internal("Failed to create server"))?;

    Ok(Json(server))
}

/// Fetch one server.
pub async fn get_server(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(server_id): Path<String>,
) -> Result<Json<McpServer>, ApiError> {
    let server = fetch_owned(&state, &server_id, &user).await?;
    Ok(Json(server))
}

/// Patch a server's configuration.
pub async fn update_server(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(server_id): Path<String>,
    Json(update): Json<McpServerUpdate>,
) -> Result<Json<McpServer>, ApiError> {
    fetch_owned(&state, &server_id, &user).await?;

    let updated = state
        .registry
        .update_config(&server_id, &update)
        .await?
        .ok_or_else(|| ApiError::internal("Failed to update server"))?;

    Ok(Json(updated))
}

/// Delete a server: remove the container first (best-effort), then the row.
pub async fn delete_server(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(server_id): Path<String>,
) -> Result<Json<ServerActionResponse>, ApiError> {
    let server = fetch_owned(&state, &server_id, &user).await?;

    if let Some(container_id) = &server.status.container_id {
        if !state.docker.remove_container(container_id, true).await {
            warn!(
                "Failed to remove container {} for server {}",
                container_id, server_id
            );
        }
    }

    let deleted = state.registry.delete(&server_id).await?;
    if !deleted {
        return Err(ApiError::internal("Failed to delete server"));
    }

    Ok(Json(ServerActionResponse {
        success: true,
        message: format!("Server '{}' deleted successfully", server.config.name),
        server: None,
    }))
}

/// Start a server.
///
/// Fetches a fresh token for the owner and patches it into the environment
/// used for the supervisor call; creates the container first when none
/// exists yet.
pub async fn start_server(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(server_id): Path<String>,
) -> Result<Json<ServerActionResponse>, ApiError> {
    let mut server = fetch_owned(&state, &server_id, &user).await?;

    if !server.can_start() {
        return Err(ApiError::Validation(format!(
            "Server cannot be started from {} state",
            server.status.status
        )));
    }

    if let Some(token) = state.auth.get_token(&user.user_id).await {
        server
            .config
            .environment
            .insert(TOKEN_ENV_KEY.to_string(), token);
    }

    let container_id = match server.status.container_id.clone() {
        Some(container_id) => container_id,
        None => {
            let created = state.docker.create_container(&server.id, &server.config).await;
            if created.status == ServerStatus::Error {
                return Err(ApiError::internal(
                    created
                        .error_message
                        .unwrap_or_else(|| "Failed to create container".to_string()),
                ));
            }
            created
                .container_id
                .ok_or_else(|| ApiError::internal("Container created without an id"))?
        }
    };

    let mut status = state.docker.start_container(&container_id).await;
    status.server_id = server.id.clone();
    state.registry.update_status(&server_id, &status).await?;

    let server = state
        .registry
        .get(&server_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Server not found".to_string()))?;

    let success = status.status == ServerStatus::Running;
    Ok(Json(ServerActionResponse {
        success,
        message: if success {
            format!("Server '{}' started successfully", server.config.name)
        } else {
            format!(
                "Failed to start server: {}",
                status.error_message.as_deref().unwrap_or("unknown error")
            )
        },
        server: Some(server),
    }))
}

/// Stop a server.
pub async fn stop_server(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(server_id): Path<String>,
) -> Result<Json<ServerActionResponse>, ApiError> {
    let server = fetch_owned(&state, &server_id, &user).await?;

    if !server.can_stop() {
        return Err(ApiError::Validation(format!(
            "Server cannot be stopped from {} state",
            server.status.status
        )));
    }

    let Some(container_id) = server.status.container_id.clone() else {
        return Err(ApiError::Validation(
            "No container found for server".to_string(),
        ));
    };

    let mut status = state
        .docker
        .stop_container(&container_id, DEFAULT_STOP_TIMEOUT)
        .await;
    status.server_id = server.id.clone();
    state.registry.update_status(&server_id, &status).await?;

    let server = state
        .registry
        .get(&server_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Server not found".to_string()))?;

    let success = status.status == ServerStatus::Stopped;
    Ok(Json(ServerActionResponse {
        success,
        message: if success {
            format!("Server '{}' stopped successfully", server.config.name)
        } else {
            format!(
                "Failed to stop server: {}",
                status.error_message.as_deref().unwrap_or("unknown error")
            )
        },
        server: Some(server),
    }))
}

/// Restart a server.
pub async fn restart_server(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(server_id): Path<String>,
) -> Result<Json<ServerActionResponse>, ApiError> {
    let mut server = fetch_owned(&state, &server_id, &user).await?;

    let Some(container_id) = server.status.container_id.clone() else {
        return Err(ApiError::Validation(
            "No container found for server".to_string(),
        ));
    };

    if let Some(token) = state.auth.get_token(&user.user_id).await {
        // The running container keeps its creation-time environment; the
        // fresh token only reaches it once the container is recreated.
        // TODO: recreate the container on restart so a rotated token lands
        // in its environment.
        server
            .config
            .environment
            .insert(TOKEN_ENV_KEY.to_string(), token);
    }

    let mut status = state
        .docker
        .restart_container(&container_id, DEFAULT_STOP_TIMEOUT)
        .await;
    status.server_id = server.id.clone();
    state.registry.update_status(&server_id, &status).await?;

    let server = state
        .registry
        .get(&server_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Server not found".to_string()))?;

    let success = status.status == ServerStatus::Running;
    Ok(Json(ServerActionResponse {
        success,
        message: if success {
            format!("Server '{}' restarted successfully", server.config.name)
        } else {
            format!(
                "Failed to restart server: {}",
                status.error_message.as_deref().unwrap_or("unknown error")
            )
        },
        server: Some(server),
    }))
}

/// Live status: consult the supervisor for ground truth and write it
/// through the registry before returning.
pub async fn get_server_status(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(server_id): Path<String>,
) -> Result<Json<McpServerStatus>, ApiError> {
    let server = fetch_owned(&state, &server_id, &user).await?;

    let Some(container_id) = &server.status.container_id else {
        return Ok(Json(server.status));
    };

    match state.docker.container_status(container_id).await {
        Some(mut status) => {
            status.server_id = server.id.clone();
            state.registry.update_status(&server_id, &status).await?;
            Ok(Json(status))
        }
        None => Ok(Json(server.status)),
    }
}

/// Stream server logs as Server-Sent Events.
pub async fn stream_server_logs(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(server_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let server = fetch_owned(&state, &server_id, &user).await?;

    let Some(container_id) = &server.status.container_id else {
        return Err(ApiError::Validation(
            "No container found for server".to_string(),
        ));
    };

    let stream = state
        .docker
        .logs(container_id, query.follow, query.tail)
        .map(|line| Ok::<Event, Infallible>(Event::default().data(line)));

    let headers = [
        (CACHE_CONTROL, "no-cache"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];

    Ok((headers, Sse::new(stream)))
}

/// One-shot health check; derives `unhealthy` when a check fails on an
/// otherwise running server and restores `running` on recovery.
pub async fn check_server_health(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(server_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let server = fetch_owned(&state, &server_id, &user).await?;

    let Some(container_id) = &server.status.container_id else {
        return Ok(Json(
            serde_json::json!({"healthy": false, "error": "No container found"}),
        ));
    };

    let (healthy, error) = state.docker.health_check(container_id).await;

    let mut status = server.status.clone();
    status.health_check_passed = healthy;
    status.last_health_check = Some(Utc::now());
    if let Some(error) = &error {
        status.error_message = Some(error.clone());
    }
    match (healthy, status.status) {
        (false, ServerStatus::Running) => status.status = ServerStatus::Unhealthy,
        (true, ServerStatus::Unhealthy) => status.status = ServerStatus::Running,
        _ => {}
    }

    state.registry.update_status(&server_id, &status).await?;

    Ok(Json(serde_json::json!({"healthy": healthy, "error": error})))
}

/// Accept a user's reply to a tool elicitation.
///
/// There is no delivery channel to the running container yet; the reply is
/// validated for ownership and acknowledged.
pub async fn respond_to_elicitation(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(server_id): Path<String>,
    Json(_response): Json<ElicitationResponse>,
) -> Result<Json<serde_json::Value>, ApiError> {
    fetch_owned(&state, &server_id, &user).await?;

    Ok(Json(
        serde_json::json!({"success": true, "message": "Response submitted"}),
    ))
}
