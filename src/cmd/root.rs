//! Main daemon command - starts the control plane

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use langconnect_mcpd::auth::AuthManager;
use langconnect_mcpd::config::Settings;
use langconnect_mcpd::docker::DockerManager;
use langconnect_mcpd::models::ServerStatus;
use langconnect_mcpd::registry::McpRegistry;
use langconnect_mcpd::router::{self, AppState};

/// Run the control plane daemon.
pub async fn run() -> Result<()> {
    let settings = Settings::from_env()?;

    info!("Configuration loaded");
    info!("  API: {}:{}", settings.host, settings.port);
    info!("  Docker network: {}", settings.docker_network);

    // Registry: connect the pool and ensure the schema
    let registry = Arc::new(McpRegistry::connect(&settings.database_url).await?);

    // Supervisor: connect to Docker and ensure the bridge network
    let docker = Arc::new(DockerManager::new(&settings.docker_network).await?);

    // Token manager
    let auth = AuthManager::new(
        &settings.api_base_url,
        &settings.supabase_url,
        &settings.supabase_key,
        &settings.jwt_secret,
    );

    let state = AppState {
        registry: registry.clone(),
        docker: docker.clone(),
        auth: auth.clone(),
    };
    let app = router::build_router(state);

    // Create shutdown token for background tasks
    let shutdown_token = CancellationToken::new();

    // Periodically reconcile registry rows against live containers
    let reconcile_registry = registry.clone();
    let reconcile_docker = docker.clone();
    let reconcile_token = shutdown_token.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = reconcile_token.cancelled() => {
                    debug!("Orphan reconciler stopped");
                    return;
                }
                _ = interval.tick() => {
                    reconcile_orphans(&reconcile_registry, &reconcile_docker).await;
                }
            }
        }
    });
    info!("Started orphan reconciler (every 60s)");

    let bind_addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Starting HTTP server on {}", bind_addr);

    let shutdown_auth = auth.clone();
    let shutdown_registry = registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install CTRL+C handler: {}", e);
                return;
            }
            warn!("Received shutdown signal, cleaning up...");

            shutdown_token.cancel();
            shutdown_auth.close().await;
            shutdown_registry.close().await;
        })
        .await?;

    info!("Daemon stopped");
    Ok(())
}

/// Mark servers whose container vanished outside the control plane.
///
/// Rows that claim an active container but have none in the runtime are
/// written back as stopped with the container id cleared.
async fn reconcile_orphans(registry: &McpRegistry, docker: &DockerManager) {
    let managed: std::collections::HashSet<String> = docker
        .list_mcp_containers()
        .await
        .into_iter()
        .map(|c| c.server_id)
        .collect();

    for status in [
        ServerStatus::Running,
        ServerStatus::Starting,
        ServerStatus::Unhealthy,
    ] {
        let servers = match registry.servers_by_status(status).await {
            Ok(servers) => servers,
            Err(e) => {
                warn!("Orphan reconciler failed to list {} servers: {}", status, e);
                continue;
            }
        };

        for server in servers {
            if server.status.container_id.is_none() || managed.contains(&server.id) {
                continue;
            }

            info!(
                "Server {} ({}) lost its container, marking stopped",
                server.config.name, server.id
            );
            let mut new_status = server.status.clone();
            new_status.status = ServerStatus::Stopped;
            new_status.container_id = None;
            new_status.error_message =
                Some("Container removed outside the control plane".to_string());

            if let Err(e) = registry.update_status(&server.id, &new_status).await {
                warn!("Failed to mark server {} stopped: {}", server.id, e);
            }
        }
    }
}
