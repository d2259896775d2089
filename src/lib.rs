//! LangConnect MCP Daemon Library
//!
//! Control plane for MCP server containers: the registry persists declared
//! server specifications, the supervisor reconciles them with the Docker
//! runtime, and the token manager keeps per-user credentials fresh. The
//! router wires the three into an HTTP API.

pub mod auth;
pub mod config;
pub mod docker;
pub mod error;
pub mod models;
pub mod registry;
pub mod router;

// Re-export commonly used types
pub use auth::AuthManager;
pub use config::Settings;
pub use docker::DockerManager;
pub use registry::McpRegistry;
