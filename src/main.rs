use std::sync::Arc;

use anyhow::Context as _;
use mcp_session_server::config::ServerConfig;
use mcp_session_server::server::{McpServer, McpServerOptions};
use mcp_session_server::tools;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_session_server=info,tower_http=info".into()),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let server = Arc::new(McpServer::new(McpServerOptions::from(&config))?);
    tools::register_builtin(server.registry()).context("register built-in tools")?;

    let app = Arc::clone(&server).router(&config.path);
    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, path = %config.path, "MCP server listening");

    // Sessions are closed before axum drains connections so open SSE streams
    // end and the graceful shutdown can complete.
    let shutdown_server = Arc::clone(&server);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            info!("shutting down server");
            shutdown_server.close().await;
        })
        .await
        .context("serve")?;

    // No-op if the signal handler already ran.
    server.close().await;
    Ok(())
}
