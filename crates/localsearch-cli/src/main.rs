//! localsearch-mcp: exposes the local search script as an MCP server on stdio.
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "local-search": { "command": "localsearch-mcp" }
//!   }
//! }
//! ```

mod args;

use anyhow::{Context, Result};
use clap::Parser;
use localsearch_core::{
    BridgeConfig, CapabilityRegistry, ServerInfo, SessionDispatcher, StdioTransport,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // stdout carries the protocol, so logs go to stderr only.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("localsearch_core=info,localsearch_mcp=info")
        }))
        .init();

    let config =
        BridgeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let config = args.apply(config);

    tracing::info!(
        "Starting {} (command={}, timeout={}s, max_output={}B)",
        config.server_name,
        config.search.command,
        config.timeout_secs,
        config.max_output_bytes
    );

    let registry =
        CapabilityRegistry::builtin(&config).context("Failed to register capabilities")?;
    tracing::info!("Registered capabilities: {:?}", registry.names());
    let mut dispatcher = SessionDispatcher::new(registry, ServerInfo::from_config(&config));

    tracing::info!("Serving on stdio");
    dispatcher
        .serve(StdioTransport::stdio())
        .await
        .context("MCP session failed")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}
