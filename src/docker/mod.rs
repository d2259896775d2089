//! Container supervisor
//!
//! The only module that talks to the Docker daemon. Translates declared
//! server configurations into container primitives and maps runtime state
//! words back onto the lifecycle states. Runtime failures never cross this
//! boundary as errors: they become `error` statuses carrying a message.

mod logs;
mod stats;

pub use logs::stream_logs;
pub use stats::{calculate_cpu_percent, calculate_resource_usage};

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, HealthStatusEnum, HostConfig, PortBinding,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use chrono::Utc;
use futures_util::Stream;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::models::{McpServerConfig, McpServerStatus, ServerStatus};

/// Label marking containers managed by this control plane.
pub const TYPE_LABEL: &str = "com.langconnect.type";
/// Label carrying the registry server id.
pub const SERVER_ID_LABEL: &str = "com.langconnect.server-id";
/// Label carrying the server name.
pub const SERVER_NAME_LABEL: &str = "com.langconnect.server-name";

const TYPE_LABEL_VALUE: &str = "mcp-server";

/// Default grace period for stop and restart, in seconds.
pub const DEFAULT_STOP_TIMEOUT: i64 = 10;

/// Summary of a managed container, as reported by `list_mcp_containers`.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub status: String,
    pub server_id: String,
    pub server_name: String,
}

/// Docker container name for a server name.
pub fn container_name(server_name: &str) -> String {
    format!("mcp-{server_name}")
}

/// Map a Docker state word onto a lifecycle state.
///
/// The supervisor never emits `unhealthy`; the controller derives it from
/// health checks on an otherwise running container.
pub fn map_container_state(state: Option<ContainerStateStatusEnum>) -> ServerStatus {
    match state {
        Some(ContainerStateStatusEnum::RUNNING) => ServerStatus::Running,
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::PAUSED) => {
            ServerStatus::Stopped
        }
        Some(ContainerStateStatusEnum::RESTARTING) => ServerStatus::Starting,
        Some(ContainerStateStatusEnum::DEAD) => ServerStatus::Error,
        _ => ServerStatus::Error,
    }
}

/// Parse a memory limit with docker-style unit suffix into bytes.
pub fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_ascii_lowercase();
    if limit.is_empty() {
        return None;
    }
    if let Ok(bytes) = limit.parse::<i64>() {
        return (bytes >= 0).then_some(bytes);
    }

    let (number, suffix) = limit.split_at(limit.len() - 1);
    let multiplier: i64 = match suffix {
        "b" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return None,
    };

    let value = number.parse::<f64>().ok()?;
    if value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as i64)
}

fn restart_policy_name(policy: &str) -> RestartPolicyNameEnum {
    match policy {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "no" => RestartPolicyNameEnum::NO,
        _ => RestartPolicyNameEnum::UNLESS_STOPPED,
    }
}

/// Supervisor for MCP server containers.
#[derive(Clone)]
pub struct DockerManager {
    client: Docker,
    network_name: String,
}

impl DockerManager {
    /// Connect to the local Docker daemon and ensure the MCP bridge network
    /// exists.
    pub async fn new(network_name: impl Into<String>) -> anyhow::Result<Self> {
        let client = Docker::connect_with_local_defaults()?;
        let network_name = network_name.into();

        ensure_network(&client, &network_name).await?;

        Ok(Self {
            client,
            network_name,
        })
    }

    pub fn client(&self) -> &Docker {
        &self.client
    }

    /// Create a container for the server in the detached, not-yet-started
    /// state.
    ///
    /// A stale container holding the derived name is force-removed first.
    /// The returned status is `stopped` with `container_id` populated, or
    /// `error` when the runtime rejects the configuration.
    pub async fn create_container(
        &self,
        server_id: &str,
        config: &McpServerConfig,
    ) -> McpServerStatus {
        let container_name = container_name(&config.name);

        if self.resolve_container(&container_name).await.is_some() {
            debug!("Removing stale container {}", container_name);
            self.remove_container(&container_name, true).await;
        }

        let Some(memory) = parse_memory_limit(&config.memory_limit) else {
            return McpServerStatus::error(
                server_id,
                format!("Invalid memory limit: {}", config.memory_limit),
            );
        };

        // User-supplied environment first; the fixed keys win on collision.
        let mut environment = config.environment.clone();
        if !config.middleware_config.is_empty() {
            match serde_json::to_string(&config.middleware_config) {
                Ok(json) => {
                    environment.insert("MCP_MIDDLEWARE_CONFIG".to_string(), json);
                }
                Err(e) => {
                    return McpServerStatus::error(
                        server_id,
                        format!("Invalid middleware config: {e}"),
                    );
                }
            }
        }
        environment.insert("MCP_SERVER_NAME".to_string(), config.name.clone());
        environment.insert("MCP_SERVER_ID".to_string(), server_id.to_string());
        environment.insert("MCP_TRANSPORT".to_string(), config.transport.to_string());
        environment.insert("MCP_PORT".to_string(), config.port.to_string());

        let env_vars: Vec<String> = environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mut labels = config.labels.clone();
        labels.insert(TYPE_LABEL.to_string(), TYPE_LABEL_VALUE.to_string());
        labels.insert(SERVER_ID_LABEL.to_string(), server_id.to_string());
        labels.insert(SERVER_NAME_LABEL.to_string(), config.name.clone());

        let port_key = format!("{}/tcp", config.port);
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key.clone(), HashMap::new());

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(config.port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: if config.volumes.is_empty() {
                None
            } else {
                Some(config.volumes.clone())
            },
            memory: Some(memory),
            cpu_quota: Some((config.cpu_limit * 100_000.0).round() as i64),
            cpu_period: Some(100_000),
            restart_policy: Some(RestartPolicy {
                name: Some(restart_policy_name(&config.restart_policy)),
                ..Default::default()
            }),
            network_mode: Some(self.network_name.clone()),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.docker_image.clone()),
            env: Some(env_vars),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        match self
            .client
            .create_container(Some(options), container_config)
            .await
        {
            Ok(response) => {
                info!("Created container {} ({})", container_name, response.id);
                McpServerStatus {
                    container_id: Some(response.id),
                    ..McpServerStatus::stopped(server_id)
                }
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                error!("Docker image not found: {}", config.docker_image);
                McpServerStatus::error(
                    server_id,
                    format!("Docker image not found: {}", config.docker_image),
                )
            }
            Err(e) => {
                error!("Failed to create container: {}", e);
                McpServerStatus::error(server_id, e.to_string())
            }
        }
    }

    /// Start a container and confirm it reached the running state.
    pub async fn start_container(&self, container_id: &str) -> McpServerStatus {
        match self
            .client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            // 304: already running; the inspect below reports the truth.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => {
                error!("Failed to start container: {}", e);
                return McpServerStatus::error("", start_error_message(e));
            }
        }

        // Give the entrypoint a moment before trusting the state word.
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        match self.resolve_container(container_id).await {
            Some(info) => {
                let server_id = label_value(&info, SERVER_ID_LABEL);
                let state = info.state.as_ref().and_then(|s| s.status);
                if state == Some(ContainerStateStatusEnum::RUNNING) {
                    McpServerStatus {
                        status: ServerStatus::Running,
                        container_id: info.id.clone(),
                        started_at: Some(Utc::now()),
                        ..McpServerStatus::stopped(server_id)
                    }
                } else {
                    let word = state.map(|s| s.to_string()).unwrap_or_default();
                    McpServerStatus {
                        container_id: info.id.clone(),
                        ..McpServerStatus::error(
                            server_id,
                            format!("Container failed to start: {word}"),
                        )
                    }
                }
            }
            None => McpServerStatus::error("", "Container not found"),
        }
    }

    /// Stop a container with the given grace period.
    pub async fn stop_container(&self, container_id: &str, timeout: i64) -> McpServerStatus {
        let Some(info) = self.resolve_container(container_id).await else {
            return McpServerStatus::error("", "Container not found");
        };
        let server_id = label_value(&info, SERVER_ID_LABEL);

        match self
            .client
            .stop_container(container_id, Some(StopContainerOptions { t: timeout }))
            .await
        {
            // 304: already stopped. Stopping twice is legal.
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => McpServerStatus {
                status: ServerStatus::Stopped,
                container_id: info.id.clone(),
                stopped_at: Some(Utc::now()),
                ..McpServerStatus::stopped(server_id)
            },
            Err(e) => {
                error!("Failed to stop container: {}", e);
                McpServerStatus::error(server_id, e.to_string())
            }
        }
    }

    /// Restart a container and confirm it came back up.
    pub async fn restart_container(&self, container_id: &str, timeout: i64) -> McpServerStatus {
        if self.resolve_container(container_id).await.is_none() {
            return McpServerStatus::error("", "Container not found");
        }

        if let Err(e) = self
            .client
            .restart_container(
                container_id,
                Some(RestartContainerOptions {
                    t: timeout as isize,
                }),
            )
            .await
        {
            error!("Failed to restart container: {}", e);
            return McpServerStatus::error("", e.to_string());
        }

        // Restart churns through stop and start; give it a longer settle.
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        match self.resolve_container(container_id).await {
            Some(info) => {
                let server_id = label_value(&info, SERVER_ID_LABEL);
                let state = info.state.as_ref().and_then(|s| s.status);
                if state == Some(ContainerStateStatusEnum::RUNNING) {
                    McpServerStatus {
                        status: ServerStatus::Running,
                        container_id: info.id.clone(),
                        started_at: Some(Utc::now()),
                        ..McpServerStatus::stopped(server_id)
                    }
                } else {
                    let word = state.map(|s| s.to_string()).unwrap_or_default();
                    McpServerStatus {
                        container_id: info.id.clone(),
                        ..McpServerStatus::error(
                            server_id,
                            format!("Container failed to restart: {word}"),
                        )
                    }
                }
            }
            None => McpServerStatus::error("", "Container not found"),
        }
    }

    /// Remove a container. Removing an already-absent container succeeds.
    pub async fn remove_container(&self, container_id: &str, force: bool) -> bool {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(()) => true,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => true,
            Err(e) => {
                error!("Failed to remove container: {}", e);
                false
            }
        }
    }

    /// Observe the current status of a container: mapped lifecycle state,
    /// one-shot resource sample, and health verdict.
    ///
    /// Returns `None` when the container does not exist.
    pub async fn container_status(&self, container_id: &str) -> Option<McpServerStatus> {
        let info = self.resolve_container(container_id).await?;
        let server_id = label_value(&info, SERVER_ID_LABEL);
        let status = map_container_state(info.state.as_ref().and_then(|s| s.status));

        let resource_usage = match info.id.as_deref() {
            Some(id) => stats::sample(&self.client, id).await,
            None => None,
        };

        Some(McpServerStatus {
            status,
            container_id: info.id.clone(),
            health_check_passed: health_verdict(&info),
            last_health_check: Some(Utc::now()),
            resource_usage,
            ..McpServerStatus::stopped(server_id)
        })
    }

    /// One-shot health check.
    ///
    /// A container that is not running is unhealthy with a reason. When a
    /// runtime-native health check is configured its verdict is used,
    /// including the last probe output on failure; otherwise a running
    /// container is presumed healthy.
    pub async fn health_check(&self, container_id: &str) -> (bool, Option<String>) {
        let Some(info) = self.resolve_container(container_id).await else {
            return (false, Some("Container not found".to_string()));
        };

        let state = info.state.as_ref().and_then(|s| s.status);
        if state != Some(ContainerStateStatusEnum::RUNNING) {
            let word = state.map(|s| s.to_string()).unwrap_or_default();
            return (false, Some(format!("Container is {word}")));
        }

        let health = info.state.as_ref().and_then(|s| s.health.as_ref());
        if let Some(health) = health {
            match health.status {
                Some(HealthStatusEnum::HEALTHY) => (true, None),
                Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None => (true, None),
                Some(status) => {
                    let last_log = health
                        .log
                        .as_ref()
                        .and_then(|log| log.last())
                        .and_then(|entry| entry.output.clone())
                        .unwrap_or_default();
                    (false, Some(format!("Health check {status}: {last_log}")))
                }
            }
        } else {
            (true, None)
        }
    }

    /// Stream log lines from a container. See [`logs::stream_logs`].
    pub fn logs(
        &self,
        container_id: &str,
        follow: bool,
        tail: u32,
    ) -> impl Stream<Item = String> {
        stream_logs(&self.client, container_id, follow, tail)
    }

    /// All containers carrying the managed-type label, running or not.
    pub async fn list_mcp_containers(&self) -> Vec<ManagedContainer> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{TYPE_LABEL}={TYPE_LABEL_VALUE}")],
        );

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        match self.client.list_containers(Some(options)).await {
            Ok(containers) => containers
                .into_iter()
                .map(|c| {
                    let labels = c.labels.unwrap_or_default();
                    ManagedContainer {
                        id: c.id.unwrap_or_default(),
                        name: c
                            .names
                            .and_then(|names| names.into_iter().next())
                            .map(|n| n.trim_start_matches('/').to_string())
                            .unwrap_or_default(),
                        status: c.state.unwrap_or_default(),
                        server_id: labels.get(SERVER_ID_LABEL).cloned().unwrap_or_default(),
                        server_name: labels.get(SERVER_NAME_LABEL).cloned().unwrap_or_default(),
                    }
                })
                .collect(),
            Err(e) => {
                error!("Failed to list containers: {}", e);
                Vec::new()
            }
        }
    }

    /// Inspect a container by id or name; `None` when it does not exist.
    async fn resolve_container(&self, container_id: &str) -> Option<ContainerInspectResponse> {
        match self.client.inspect_container(container_id, None).await {
            Ok(info) => Some(info),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => None,
            Err(e) => {
                error!("Failed to inspect container {}: {}", container_id, e);
                None
            }
        }
    }
}

fn start_error_message(e: bollard::errors::Error) -> String {
    if let bollard::errors::Error::DockerResponseServerError {
        status_code: 404, ..
    } = e
    {
        "Container not found".to_string()
    } else {
        e.to_string()
    }
}

fn label_value(info: &ContainerInspectResponse, label: &str) -> String {
    info.config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .and_then(|labels| labels.get(label))
        .cloned()
        .unwrap_or_default()
}

/// True when the container is healthy: the native health verdict when one is
/// configured, otherwise whether it is running.
fn health_verdict(info: &ContainerInspectResponse) -> bool {
    let state = info.state.as_ref();
    match state.and_then(|s| s.health.as_ref()).and_then(|h| h.status) {
        Some(HealthStatusEnum::HEALTHY) => true,
        Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None => {
            state.and_then(|s| s.status) == Some(ContainerStateStatusEnum::RUNNING)
        }
        Some(_) => false,
    }
}

async fn ensure_network(client: &Docker, network_name: &str) -> anyhow::Result<()> {
    match client
        .inspect_network(network_name, None::<InspectNetworkOptions<String>>)
        .await
    {
        Ok(_) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            info!("Creating Docker network: {}", network_name);
            let mut labels = HashMap::new();
            labels.insert("app", "langconnect");
            labels.insert("component", "mcp");

            client
                .create_network(CreateNetworkOptions {
                    name: network_name,
                    driver: "bridge",
                    labels,
                    ..Default::default()
                })
                .await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name() {
        assert_eq!(container_name("alpha"), "mcp-alpha");
    }

    #[test]
    fn test_map_container_state() {
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::RUNNING)),
            ServerStatus::Running
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::EXITED)),
            ServerStatus::Stopped
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::PAUSED)),
            ServerStatus::Stopped
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::RESTARTING)),
            ServerStatus::Starting
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::DEAD)),
            ServerStatus::Error
        );
        assert_eq!(
            map_container_state(Some(ContainerStateStatusEnum::CREATED)),
            ServerStatus::Error
        );
        assert_eq!(map_container_state(None), ServerStatus::Error);
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("256k"), Some(256 * 1024));
        assert_eq!(parse_memory_limit("1024"), Some(1024));
        assert_eq!(parse_memory_limit("1.5g"), Some((1.5 * 1024.0 * 1024.0 * 1024.0) as i64));

        assert_eq!(parse_memory_limit(""), None);
        assert_eq!(parse_memory_limit("abc"), None);
        assert_eq!(parse_memory_limit("12x"), None);
    }

    #[test]
    fn test_restart_policy_name() {
        assert_eq!(restart_policy_name("always"), RestartPolicyNameEnum::ALWAYS);
        assert_eq!(restart_policy_name("no"), RestartPolicyNameEnum::NO);
        assert_eq!(
            restart_policy_name("on-failure"),
            RestartPolicyNameEnum::ON_FAILURE
        );
        assert_eq!(
            restart_policy_name("unless-stopped"),
            RestartPolicyNameEnum::UNLESS_STOPPED
        );
        assert_eq!(
            restart_policy_name("anything-else"),
            RestartPolicyNameEnum::UNLESS_STOPPED
        );
    }
}
