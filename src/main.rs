use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::ServiceExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use codemap::lsp_fleet::LspFleet;
use codemap::server::CodemapServer;
use codemap::status::IndexTracker;
use codemap::store::GraphStore;
use codemap::toolchain::{self, ToolchainResolver};
use codemap::workspace;

#[derive(Debug, Parser)]
#[command(name = "codemap", version, about = "Code-intelligence MCP server")]
struct Args {
    /// Workspace root to index; defaults to the current directory's
    /// repository root.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Log filter, e.g. "info" or "codemap=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the MCP transport; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let workspace_root = match args.workspace {
        Some(root) => root
            .canonicalize()
            .with_context(|| format!("workspace {} does not exist", root.display()))?,
        None => {
            let cwd = std::env::current_dir().context("current directory is not accessible")?;
            workspace::find_workspace_root(&cwd)
        }
    };
    info!("workspace root: {}", workspace_root.display());

    let store_dir = toolchain::graph_dir(&workspace_root)?;
    let store = Arc::new(GraphStore::open(&store_dir)?);
    let resolver = Arc::new(ToolchainResolver::new()?);
    let fleet = Arc::new(LspFleet::new(&workspace_root, resolver));
    let tracker = Arc::new(IndexTracker::new());

    let server = CodemapServer::new(store, fleet.clone(), workspace_root, tracker);

    info!("codemap {} serving over stdio", env!("CARGO_PKG_VERSION"));
    let running = server
        .serve(rmcp::transport::io::stdio())
        .await
        .context("mcp server failed to start")?;
    let quit_reason = running.waiting().await;
    info!("mcp client disconnected: {quit_reason:?}");

    fleet.close().await;
    Ok(())
}
