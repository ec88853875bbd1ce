/// Fetch MCP Server Entry Point
///
/// Loads configuration from the environment (see `core::config`), sets up
/// logging on stderr, and runs the configured transport(s).

use std::sync::Arc;

use fetch_mcp_server::core::config::{ServerConfig, Transport};
use fetch_mcp_server::core::server::{self, McpServer};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // stdout carries the JSON-RPC stream, so logs must go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_tracing();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let mcp = Arc::new(McpServer::new(
        config.name.clone(),
        config.version.clone(),
        server::initialize_tools(),
    ));

    match config.transport {
        Transport::Stdio => server::run_server_stdio(mcp).await,
        Transport::Http => server::run_server_http(&config, mcp).await,
        Transport::Both => {
            // STDIO in the background, HTTP in the foreground
            let stdio_handle = tokio::spawn({
                let mcp = mcp.clone();
                async move {
                    if let Err(e) = server::run_server_stdio(mcp).await {
                        tracing::error!(error = %e, "STDIO server error");
                    }
                }
            });

            let http_result = server::run_server_http(&config, mcp).await;

            // If HTTP server exits, abort STDIO task
            stdio_handle.abort();

            http_result
        }
    }
}
