use anyhow::Result;
use prompt_forge::config::Config;
use prompt_forge::server::PromptForgeServer;
use rmcp::{ServiceExt, transport::stdio};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    prompt_forge::load_env();

    // A test-runner worker process must not start the real server
    if std::env::var("FORGE_TEST_WORKER").is_ok() {
        return Ok(());
    }

    let config = Config::load()?;

    if !config.runtime.mcp_no_log {
        tracing_subscriber::fmt()
            .with_env_filter(config.runtime.log_level.clone())
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("Starting prompt-forge MCP server");

    let server = PromptForgeServer::new(config).await.map_err(|e| {
        eprintln!("Failed to create server: {}", e);
        e
    })?;
    let shutdown_handle = server.clone();

    let service = server.serve(stdio()).await.map_err(|e| {
        eprintln!("Failed to start MCP service: {}", e);
        e
    })?;

    info!("MCP server ready - waiting for requests");
    service.waiting().await?;

    info!("Transport closed, flushing state");
    shutdown_handle.shutdown().await;

    Ok(())
}
