//! Server registry
//!
//! Durable, queryable ledger of MCP server records over PostgreSQL, with the
//! declared config and observed status stored as JSONB documents. The
//! registry is the source of truth for server identity, assigned ports, and
//! last-known status.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, QueryBuilder, Row};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::{
    validate_name, McpServer, McpServerConfig, McpServerCreate, McpServerList, McpServerStatus,
    McpServerUpdate, ServerStatus,
};

/// First port considered by the auto-assignment scan.
const START_PORT: u16 = 8765;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Unique-name collision on insert.
    #[error("Server name '{0}' already exists")]
    NameConflict(String),

    /// Malformed input (name format, port or CPU range).
    #[error("{0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored JSON document no longer deserializes.
    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry of MCP server records.
pub struct McpRegistry {
    pool: PgPool,
}

impl McpRegistry {
    /// Connect to the database and ensure the schema exists.
    pub async fn connect(database_url: &str) -> RegistryResult<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .connect(database_url)
            .await?;

        let registry = Self { pool };
        registry.create_tables().await?;

        info!("MCP registry initialized");
        Ok(registry)
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn create_tables(&self) -> RegistryResult<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS mcp_servers (
                id TEXT PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                config JSONB NOT NULL,
                status JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_by TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_mcp_server_status
                ON mcp_servers ((status->>'status'));

            CREATE INDEX IF NOT EXISTS idx_mcp_server_created_by
                ON mcp_servers (created_by);

            CREATE OR REPLACE FUNCTION update_updated_at_column()
            RETURNS TRIGGER AS $$
            BEGIN
                NEW.updated_at = NOW();
                RETURN NEW;
            END;
            $$ language 'plpgsql';

            DROP TRIGGER IF EXISTS update_mcp_servers_updated_at ON mcp_servers;

            CREATE TRIGGER update_mcp_servers_updated_at
            BEFORE UPDATE ON mcp_servers
            FOR EACH ROW
            EXECUTE FUNCTION update_updated_at_column();
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Register a new server.
    ///
    /// Generates the id, allocates a port when none was requested, and
    /// inserts the record with a fresh `stopped` status.
    pub async fn register(
        &self,
        create: McpServerCreate,
        user_id: &str,
    ) -> RegistryResult<McpServer> {
        let name = validate_name(&create.name).map_err(RegistryError::Validation)?;

        if !(create.cpu_limit > 0.0 && create.cpu_limit <= 4.0) {
            return Err(RegistryError::Validation(
                "cpu_limit must be in (0, 4] cores".to_string(),
            ));
        }
        if let Some(port) = create.port {
            if port < 1024 {
                return Err(RegistryError::Validation(
                    "port must be in [1024, 65535]".to_string(),
                ));
            }
        }

        let server_id = Uuid::new_v4().to_string();
        let port = match create.port {
            Some(port) => port,
            None => self.next_available_port().await?,
        };

        let config = McpServerConfig {
            name: name.clone(),
            description: create.description,
            transport: create.transport,
            port,
            environment: create.environment,
            docker_image: create.docker_image,
            memory_limit: create.memory_limit,
            cpu_limit: create.cpu_limit,
            restart_policy: "unless-stopped".to_string(),
            volumes: Vec::new(),
            labels: std::collections::HashMap::new(),
            middleware_config: create.middleware_config,
        };
        let status = McpServerStatus::stopped(&server_id);

        let result = sqlx::query(
            "INSERT INTO mcp_servers (id, name, config, status, created_by) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&server_id)
        .bind(&name)
        .bind(serde_json::to_value(&config)?)
        .bind(serde_json::to_value(&status)?)
        .bind(user_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return Err(RegistryError::NameConflict(name));
                }
            }
            return Err(e.into());
        }

        info!("Registered MCP server: {} ({})", name, server_id);

        self.get(&server_id)
            .await?
            .ok_or_else(|| RegistryError::Validation("server vanished after insert".to_string()))
    }

    /// Fetch a server by id.
    pub async fn get(&self, server_id: &str) -> RegistryResult<Option<McpServer>> {
        let row = sqlx::query("SELECT * FROM mcp_servers WHERE id = $1")
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_server).transpose()
    }

    /// Fetch a server by its unique name.
    pub async fn get_by_name(&self, name: &str) -> RegistryResult<Option<McpServer>> {
        let row = sqlx::query("SELECT * FROM mcp_servers WHERE name = $1")
            .bind(name.to_ascii_lowercase())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_server).transpose()
    }

    /// List servers, optionally filtered by owner and status.
    ///
    /// Filters compose with AND; rows are ordered newest-first and `total`
    /// is the unpaged count under the same filter.
    pub async fn list(
        &self,
        user_id: Option<&str>,
        status: Option<ServerStatus>,
        page: u32,
        page_size: u32,
    ) -> RegistryResult<McpServerList> {
        let status_word = status.map(|s| s.to_string());

        let mut count_query = QueryBuilder::new("SELECT COUNT(*) FROM mcp_servers");
        push_filters(&mut count_query, user_id, status_word.as_deref());
        let total: i64 = count_query.build_query_scalar().fetch_one(&self.pool).await?;

        let mut query = QueryBuilder::new("SELECT * FROM mcp_servers");
        push_filters(&mut query, user_id, status_word.as_deref());
        query.push(" ORDER BY created_at DESC LIMIT ");
        query.push_bind(i64::from(page_size));
        query.push(" OFFSET ");
        query.push_bind(i64::from(page.saturating_sub(1)) * i64::from(page_size));

        let rows = query.build().fetch_all(&self.pool).await?;
        let servers = rows
            .into_iter()
            .map(row_to_server)
            .collect::<RegistryResult<Vec<_>>>()?;

        Ok(McpServerList {
            servers,
            total,
            page,
            page_size,
        })
    }

    /// Apply a config patch, leaving the status untouched.
    pub async fn update_config(
        &self,
        server_id: &str,
        update: &McpServerUpdate,
    ) -> RegistryResult<Option<McpServer>> {
        let Some(mut server) = self.get(server_id).await? else {
            return Ok(None);
        };

        update.apply_to(&mut server.config);

        sqlx::query("UPDATE mcp_servers SET config = $2 WHERE id = $1")
            .bind(server_id)
            .bind(serde_json::to_value(&server.config)?)
            .execute(&self.pool)
            .await?;

        info!("Updated MCP server configuration: {}", server_id);
        self.get(server_id).await
    }

    /// Replace the stored status document.
    pub async fn update_status(
        &self,
        server_id: &str,
        status: &McpServerStatus,
    ) -> RegistryResult<Option<McpServer>> {
        sqlx::query("UPDATE mcp_servers SET status = $2 WHERE id = $1")
            .bind(server_id)
            .bind(serde_json::to_value(status)?)
            .execute(&self.pool)
            .await?;

        info!("Updated MCP server status: {} -> {}", server_id, status.status);
        self.get(server_id).await
    }

    /// Delete a server record. Returns whether a row was removed.
    pub async fn delete(&self, server_id: &str) -> RegistryResult<bool> {
        let result = sqlx::query("DELETE FROM mcp_servers WHERE id = $1")
            .bind(server_id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() == 1;
        if deleted {
            info!("Deleted MCP server from registry: {}", server_id);
        }
        Ok(deleted)
    }

    /// All servers currently in the given status, newest first.
    pub async fn servers_by_status(&self, status: ServerStatus) -> RegistryResult<Vec<McpServer>> {
        let rows = sqlx::query(
            "SELECT * FROM mcp_servers WHERE status->>'status' = $1 ORDER BY created_at DESC",
        )
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_server).collect()
    }

    /// Smallest port >= 8765 not currently assigned to any server.
    ///
    /// The scan reads the live port set and is not reserved transactionally;
    /// concurrent allocators may pick the same port (the unique constraint
    /// is on the name).
    async fn next_available_port(&self) -> RegistryResult<u16> {
        let rows = sqlx::query(
            "SELECT (config->>'port')::int AS port FROM mcp_servers \
             WHERE config->>'port' IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let used: HashSet<u16> = rows
            .iter()
            .filter_map(|row| row.try_get::<i32, _>("port").ok())
            .filter_map(|port| u16::try_from(port).ok())
            .collect();

        Ok(next_free_port(&used, START_PORT))
    }
}

fn push_filters(query: &mut QueryBuilder<'_, sqlx::Postgres>, user_id: Option<&str>, status: Option<&str>) {
    let mut prefix = " WHERE ";
    if let Some(user_id) = user_id {
        query.push(prefix).push("created_by = ");
        query.push_bind(user_id.to_string());
        prefix = " AND ";
    }
    if let Some(status) = status {
        query.push(prefix).push("status->>'status' = ");
        query.push_bind(status.to_string());
    }
}

fn next_free_port(used: &HashSet<u16>, start: u16) -> u16 {
    let mut port = start;
    while used.contains(&port) {
        port += 1;
    }
    port
}

fn row_to_server(row: PgRow) -> RegistryResult<McpServer> {
    let config: serde_json::Value = row.try_get("config")?;
    let status: serde_json::Value = row.try_get("status")?;

    Ok(McpServer {
        id: row.try_get("id")?,
        config: serde_json::from_value(config)?,
        status: serde_json::from_value(status)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        created_by: row.try_get("created_by")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_free_port_empty() {
        assert_eq!(next_free_port(&HashSet::new(), START_PORT), 8765);
    }

    #[test]
    fn test_next_free_port_skips_used() {
        let used: HashSet<u16> = [8765, 8766, 8770].into_iter().collect();
        assert_eq!(next_free_port(&used, START_PORT), 8767);
    }

    #[test]
    fn test_next_free_port_fills_first_gap() {
        let used: HashSet<u16> = [8766].into_iter().collect();
        assert_eq!(next_free_port(&used, START_PORT), 8765);
    }
}
