pub mod auth;
pub mod config;
pub mod handlers;
pub mod http;
pub mod hub;
pub mod session;
pub mod state;
pub mod store;
pub mod typing;

pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(session::ws_handler))
        .route("/api/register", post(http::register))
        .route("/api/login", post(http::login))
        .route("/api/health", get(http::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Startup bootstrap: make sure the default guild exists (owned by a
/// passwordless system account) and apply the `--admin-email` grant.
pub fn bootstrap(store: &mut store::Store, admin_email: Option<&str>) -> Result<(), store::StoreError> {
    if store.server_by_name(http::DEFAULT_SERVER_NAME)?.is_none() {
        let system = match store.user_by_email("system@concord.local")? {
            Some(user) => user,
            // Empty hash: no password ever matches, so the account is
            // unreachable through login.
            None => store.create_user(
                "system",
                "Concord",
                "system@concord.local",
                "",
                "",
            )?,
        };
        store.create_server(http::DEFAULT_SERVER_NAME, system.id)?;
        tracing::info!(name = http::DEFAULT_SERVER_NAME, "created default server");
    }
    if let Some(email) = admin_email {
        if store.grant_admin(email)? {
            tracing::info!(email, "granted administrator");
        } else {
            tracing::warn!(email, "admin grant deferred: no such user yet");
        }
    }
    Ok(())
}
