use std::time::Duration;

use clap::Parser;
use server::{bootstrap, config, state::AppState, store::Store};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How long connected clients get to drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let cli = config::Cli::parse();
    let config = match config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    let mut store = match Store::open(&config.db) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("FATAL: failed to open store at {}: {e}", config.db.display());
            std::process::exit(1);
        }
    };
    if let Err(e) = bootstrap(&mut store, config.admin_email.as_deref()) {
        eprintln!("FATAL: bootstrap failed: {e}");
        std::process::exit(1);
    }

    let state = AppState::new(store);
    let router = server::build_router(state.clone());
    let listener = match tokio::net::TcpListener::bind(config.bind_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {e}", config.bind_addr());
            std::process::exit(1);
        }
    };
    info!(addr = %config.bind_addr(), db = %config.db.display(), "server listening");

    let hub = state.hub.clone();
    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Stop the fan-out first so WS sessions wind down inside the grace
        // window; the listener closes when this future resolves.
        if tokio::time::timeout(SHUTDOWN_GRACE, hub.shutdown())
            .await
            .is_err()
        {
            tracing::warn!("hub did not drain within the grace window");
        }
    });
    if let Err(e) = serve.await {
        eprintln!("FATAL: server error: {e}");
        std::process::exit(1);
    }
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
