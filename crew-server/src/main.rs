//! crew-server: HTTP/SSE mirror of the `crew wt` worktree verbs.

mod error;
mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use crew::io::config::{DEFAULT_CONFIG_PATH, load_config_with_env};
use crew::io::worktree::WorktreeManager;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "crew-server")]
#[command(about = "HTTP and SSE interface to crew-managed worktrees")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Repository whose worktrees are managed
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Config file (defaults to `.crew/config.toml` in the repository)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("crew_server=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let repo = args.repo.canonicalize().unwrap_or(args.repo);
    let config_path = args
        .config
        .unwrap_or_else(|| repo.join(DEFAULT_CONFIG_PATH));
    let cfg = load_config_with_env(&config_path)?;
    let manager = WorktreeManager::from_config(&repo, &cfg)?;
    info!(repo = %repo.display(), root = %manager.root().display(), "starting crew-server");

    match manager.reconcile() {
        Ok(report) => info!(
            restored = report.restored.len(),
            orphaned = report.orphaned.len(),
            "reconciled worktree state"
        ),
        Err(err) => warn!(err = %err, "startup reconcile failed"),
    }

    let state = AppState::new(manager);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(err = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
