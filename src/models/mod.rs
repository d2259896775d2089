//! Domain models for MCP server management
//!
//! Covers the declared configuration, the observed runtime status, and the
//! request/response shapes used by the HTTP API.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Unhealthy,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
            ServerStatus::Error => "error",
            ServerStatus::Unhealthy => "unhealthy",
        };
        f.write_str(word)
    }
}

/// Transport an MCP server is reached over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerTransport {
    Stdio,
    #[default]
    Sse,
    Http,
}

impl fmt::Display for ServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            ServerTransport::Stdio => "stdio",
            ServerTransport::Sse => "sse",
            ServerTransport::Http => "http",
        };
        f.write_str(word)
    }
}

/// Middleware configuration is an opaque JSON object passed through to the
/// container environment.
pub type MiddlewareConfig = serde_json::Map<String, serde_json::Value>;

/// Declared configuration of an MCP server instance.
///
/// Stored as a JSON document; unknown fields from newer writers are ignored
/// on read and absent fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Unique server name (lowercase alphanumeric with `-` or `_`).
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub transport: ServerTransport,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default = "default_docker_image")]
    pub docker_image: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_restart_policy")]
    pub restart_policy: String,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub middleware_config: MiddlewareConfig,
}

fn default_port() -> u16 {
    8765
}

fn default_docker_image() -> String {
    "langconnect-mcp:latest".to_string()
}

fn default_memory_limit() -> String {
    "512m".to_string()
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_restart_policy() -> String {
    "unless-stopped".to_string()
}

/// Validate and normalize a server name.
///
/// Names must be non-empty ASCII alphanumeric with `-` or `_` allowed (but
/// not alone); the stored form is lowercase.
pub fn validate_name(name: &str) -> Result<String, String> {
    let stripped: String = name.chars().filter(|c| *c != '-' && *c != '_').collect();
    let valid = !name.is_empty()
        && !stripped.is_empty()
        && stripped.chars().all(|c| c.is_ascii_alphanumeric());

    if !valid {
        return Err("Server name must be alphanumeric with - or _".to_string());
    }
    Ok(name.to_ascii_lowercase())
}

/// Request body for creating a new MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerCreate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub transport: ServerTransport,
    /// Auto-assigned when omitted.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default = "default_docker_image")]
    pub docker_image: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default)]
    pub middleware_config: MiddlewareConfig,
}

/// Request body for patching an MCP server's configuration.
///
/// Only fields present in the request are applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServerUpdate {
    pub description: Option<String>,
    pub environment: Option<HashMap<String, String>>,
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<f64>,
    pub middleware_config: Option<MiddlewareConfig>,
    pub restart_policy: Option<String>,
}

impl McpServerUpdate {
    /// Apply the fields present in this patch onto an existing config.
    pub fn apply_to(&self, config: &mut McpServerConfig) {
        if let Some(description) = &self.description {
            config.description = description.clone();
        }
        if let Some(environment) = &self.environment {
            config.environment = environment.clone();
        }
        if let Some(memory_limit) = &self.memory_limit {
            config.memory_limit = memory_limit.clone();
        }
        if let Some(cpu_limit) = self.cpu_limit {
            config.cpu_limit = cpu_limit;
        }
        if let Some(middleware_config) = &self.middleware_config {
            config.middleware_config = middleware_config.clone();
        }
        if let Some(restart_policy) = &self.restart_policy {
            config.restart_policy = restart_policy.clone();
        }
    }
}

/// Point-in-time resource usage sampled from the container runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_usage_mb: f64,
    pub memory_limit_mb: f64,
    pub memory_percent: f64,
}

/// Observed runtime status of an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerStatus {
    pub server_id: String,
    pub status: ServerStatus,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub health_check_passed: bool,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub resource_usage: Option<ResourceUsage>,
}

impl McpServerStatus {
    /// Fresh status for a server that has never been materialised.
    pub fn stopped(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            status: ServerStatus::Stopped,
            container_id: None,
            started_at: None,
            stopped_at: None,
            health_check_passed: false,
            last_health_check: None,
            error_message: None,
            resource_usage: None,
        }
    }

    /// Error status carrying a diagnostic message.
    pub fn error(server_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            status: ServerStatus::Error,
            error_message: Some(message.into()),
            ..Self::stopped("")
        }
    }
}

/// Complete MCP server record: identity, declared config, observed status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServer {
    pub id: String,
    pub config: McpServerConfig,
    pub status: McpServerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

impl McpServer {
    /// Docker container name derived from the server name.
    pub fn container_name(&self) -> String {
        format!("mcp-{}", self.config.name)
    }

    pub fn is_running(&self) -> bool {
        self.status.status == ServerStatus::Running
    }

    /// A server may only be started from `stopped` or `error`.
    pub fn can_start(&self) -> bool {
        matches!(
            self.status.status,
            ServerStatus::Stopped | ServerStatus::Error
        )
    }

    /// A server may only be stopped from `running` or `unhealthy`.
    pub fn can_stop(&self) -> bool {
        matches!(
            self.status.status,
            ServerStatus::Running | ServerStatus::Unhealthy
        )
    }
}

/// Paginated server listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerList {
    pub servers: Vec<McpServer>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

/// Response for lifecycle action endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ServerActionResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<McpServer>,
}

/// Out-of-band interactive request a tool makes to the user mid-execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitationRequest {
    pub server_id: String,
    pub tool_name: String,
    pub request_id: String,
    pub prompt: String,
    pub response_schema: serde_json::Value,
    #[serde(default = "default_elicitation_timeout")]
    pub timeout: u64,
}

fn default_elicitation_timeout() -> u64 {
    300
}

/// User reply to an elicitation request.
#[derive(Debug, Clone, Deserialize)]
pub struct ElicitationResponse {
    pub request_id: String,
    pub accepted: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub declined_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with_status(status: ServerStatus) -> McpServer {
        let config: McpServerConfig =
            serde_json::from_value(serde_json::json!({"name": "alpha"})).unwrap();
        McpServer {
            id: "id-1".to_string(),
            config,
            status: McpServerStatus {
                status,
                ..McpServerStatus::stopped("id-1")
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
            created_by: "user-1".to_string(),
        }
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("my-server_1").unwrap(), "my-server_1");
        assert_eq!(validate_name("Alpha").unwrap(), "alpha");

        assert!(validate_name("").is_err());
        assert!(validate_name("-_").is_err());
        assert!(validate_name("bad name").is_err());
        assert!(validate_name("bad.name").is_err());
    }

    #[test]
    fn test_container_name() {
        let server = server_with_status(ServerStatus::Stopped);
        assert_eq!(server.container_name(), "mcp-alpha");
    }

    #[test]
    fn test_start_stop_gating() {
        assert!(server_with_status(ServerStatus::Stopped).can_start());
        assert!(server_with_status(ServerStatus::Error).can_start());
        assert!(!server_with_status(ServerStatus::Running).can_start());
        assert!(!server_with_status(ServerStatus::Starting).can_start());
        assert!(!server_with_status(ServerStatus::Stopping).can_start());

        assert!(server_with_status(ServerStatus::Running).can_stop());
        assert!(server_with_status(ServerStatus::Unhealthy).can_stop());
        assert!(!server_with_status(ServerStatus::Stopped).can_stop());
        assert!(!server_with_status(ServerStatus::Starting).can_stop());
        assert!(!server_with_status(ServerStatus::Error).can_stop());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ServerStatus::Unhealthy).unwrap();
        assert_eq!(json, "\"unhealthy\"");
        assert_eq!(ServerStatus::Running.to_string(), "running");
    }

    #[test]
    fn test_status_json_ignores_unknown_fields() {
        let status: McpServerStatus = serde_json::from_value(serde_json::json!({
            "server_id": "id-1",
            "status": "stopped",
            "some_future_field": {"nested": true},
        }))
        .unwrap();

        assert_eq!(status.status, ServerStatus::Stopped);
        assert!(status.container_id.is_none());
        assert!(!status.health_check_passed);
    }

    #[test]
    fn test_config_defaults_from_sparse_json() {
        let config: McpServerConfig =
            serde_json::from_value(serde_json::json!({"name": "alpha"})).unwrap();

        assert_eq!(config.port, 8765);
        assert_eq!(config.transport, ServerTransport::Sse);
        assert_eq!(config.docker_image, "langconnect-mcp:latest");
        assert_eq!(config.memory_limit, "512m");
        assert_eq!(config.restart_policy, "unless-stopped");
        assert!(config.middleware_config.is_empty());
    }

    #[test]
    fn test_update_applies_only_present_fields() {
        let mut config: McpServerConfig =
            serde_json::from_value(serde_json::json!({"name": "alpha"})).unwrap();
        let before = config.clone();

        McpServerUpdate::default().apply_to(&mut config);
        assert_eq!(config, before);

        let patch = McpServerUpdate {
            description: Some("updated".to_string()),
            cpu_limit: Some(2.5),
            ..Default::default()
        };
        patch.apply_to(&mut config);

        assert_eq!(config.description, "updated");
        assert_eq!(config.cpu_limit, 2.5);
        assert_eq!(config.memory_limit, before.memory_limit);
        assert_eq!(config.environment, before.environment);
    }
}
