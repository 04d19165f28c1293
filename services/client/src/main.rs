//! Headless Concord client: connects to every configured endpoint and logs
//! the event stream. The terminal UI sits on top of the same library
//! surface; this binary is what you get without it.

use clap::Parser;
use client::event_loop::{self, ClientState};
use client::{ConnectionManager, ReconnectPolicy, UnreadTracker, storage};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "client", about = "Concord multi-server chat client")]
struct Cli {
    /// Directory holding servers.json and config.json; defaults to the
    /// per-user data dir.
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let cli = Cli::parse();
    let dir = cli.data_dir.unwrap_or_else(storage::data_dir);
    let servers = match storage::load_servers(&dir.join("servers.json")) {
        Ok(servers) => servers,
        Err(e) => {
            eprintln!("FATAL: failed to load servers.json: {e}");
            std::process::exit(1);
        }
    };
    let config = match storage::load_config(&dir.join("config.json")) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config.json: {e}");
            std::process::exit(1);
        }
    };
    if servers.servers.is_empty() {
        eprintln!("no servers configured; add one to {}", dir.join("servers.json").display());
        std::process::exit(1);
    }

    let alias = config
        .identity
        .as_ref()
        .map(|i| i.alias.clone())
        .unwrap_or_default();
    let unread = UnreadTracker::with_muted(config.ui.muted_channels.iter().copied());
    let (manager, event_rx) =
        ConnectionManager::new(config.identity.clone(), ReconnectPolicy::default());

    for info in servers.servers {
        info!(endpoint = %info.name, address = %info.address, "supervising endpoint");
        manager.add_endpoint(info).await;
    }

    let state = ClientState::new(&alias, unread);
    let (redraw_tx, mut redraw_rx) = tokio::sync::watch::channel(0u64);
    let loop_task = tokio::spawn(event_loop::run(event_rx, state, redraw_tx));

    // Without a UI, "redraw" is a log line.
    let log_task = tokio::spawn(async move {
        while redraw_rx.changed().await.is_ok() {
            let n = *redraw_rx.borrow();
            tracing::debug!(updates = n, "state updated");
        }
    });

    tokio::signal::ctrl_c().await.expect("install Ctrl+C handler");
    info!("shutting down");
    manager.close().await;
    log_task.abort();
    // The loop ends once every connection task has dropped its sender.
    drop(manager);
    match tokio::time::timeout(std::time::Duration::from_secs(5), loop_task).await {
        Ok(_) => info!("client shut down gracefully"),
        Err(_) => tracing::warn!("event loop did not drain in time"),
    }
}
