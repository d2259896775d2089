//! Daemon settings
//!
//! Configuration comes from the environment (a `.env` file is honored in
//! development). `DATABASE_URL` is the only hard requirement; the identity
//! provider settings default to empty, which leaves bearer-token validation
//! rejecting everything until they are supplied.

use anyhow::{Context, Result};

/// Runtime settings for the control plane.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Host to bind the HTTP API to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// PostgreSQL connection URL for the registry.
    pub database_url: String,

    /// Base URL of the API exposing the sign-in endpoint.
    pub api_base_url: String,

    /// Supabase project URL (token refresh endpoint).
    pub supabase_url: String,

    /// Supabase anon key.
    pub supabase_key: String,

    /// Secret used to validate HS256 access tokens.
    pub jwt_secret: String,

    /// Docker bridge network all MCP containers attach to.
    pub docker_network: String,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let port = env_or("MCPD_PORT", "8080")
            .parse::<u16>()
            .context("MCPD_PORT must be a port number")?;

        Ok(Self {
            host: env_or("MCPD_HOST", "0.0.0.0"),
            port,
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            api_base_url: env_or("API_BASE_URL", "http://localhost:8080"),
            supabase_url: env_or("SUPABASE_URL", ""),
            supabase_key: env_or("SUPABASE_KEY", ""),
            jwt_secret: env_or("SUPABASE_JWT_SECRET", ""),
            docker_network: env_or("MCPD_DOCKER_NETWORK", "langconnect-network"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
