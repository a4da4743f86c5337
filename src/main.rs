//! code-sandbox daemon
//!
//! MCP server that runs and debugs user code in per-owner Docker containers.
//! Configuration comes from an optional JSON file plus environment overrides.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use code_sandbox_daemon::{
    config::Config, events::LogRecordStore, mcp, runtime::DockerRuntime, sandbox::Sandbox,
};

#[derive(Parser, Debug)]
#[command(name = "code-sandbox-daemon")]
#[command(about = "MCP server for containerized code execution and debugging")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON configuration file
    #[arg(long, env = "CODE_SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Leave containers from previous runs alone at startup
    #[arg(long)]
    skip_prune: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if !args.stdio {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    info!(
        network = %config.docker.network,
        timeout_ms = config.execution.timeout_ms,
        grace_seconds = config.session.disconnect_grace_seconds,
        "Loaded configuration"
    );

    let runtime = DockerRuntime::connect(config.docker.socket_path.as_deref())
        .await
        .context("Failed to connect to Docker")?;

    let sandbox = Arc::new(Sandbox::new(
        Arc::new(runtime),
        config,
        Arc::new(LogRecordStore),
    ));

    if !args.skip_prune {
        match sandbox.prune_orphans().await {
            Ok(removed) => info!(count = removed.len(), "Startup orphan sweep finished"),
            Err(e) => warn!(error = %e, "Startup orphan sweep failed"),
        }
    }

    let reaper = sandbox.start_reaper();

    let served = mcp::serve_stdio(Arc::clone(&sandbox)).await;

    reaper.abort();
    sandbox.shutdown().await;

    served
}
