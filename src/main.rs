//! LangConnect MCP daemon - control plane for MCP server containers
//!
//! This daemon manages Docker containers for user-defined MCP servers,
//! providing an API for server lifecycle management, status tracking,
//! log streaming, and authentication token renewal.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "langconnect-mcpd")]
#[command(about = "MCP server container control plane")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("langconnect_mcpd={}", log_level).into()),
        )
        .init();

    info!("Starting LangConnect MCP daemon v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = cmd::root::run().await {
        error!("Daemon error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
