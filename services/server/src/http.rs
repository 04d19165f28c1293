//! HTTP endpoints: registration, login, and health.
//!
//! These are the only request/response surfaces; everything else rides the
//! WebSocket. Registration also joins the new user to the default guild so
//! a fresh account lands somewhere it can talk.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use concord_protocol::events::{Event, ServerMemberAddPayload};
use concord_protocol::User;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::auth;
use crate::hub::Target;
use crate::state::AppState;
use crate::store::StoreError;

pub const MIN_USERNAME_CHARS: usize = 2;
pub const MAX_USERNAME_CHARS: usize = 32;
pub const MIN_PASSWORD_BYTES: usize = 8;

/// The guild every new account joins. Created at startup.
pub const DEFAULT_SERVER_NAME: &str = "concord";

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
}

#[derive(Debug, Serialize)]
struct HttpError {
    code: &'static str,
    message: String,
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (status, Json(HttpError { code, message: message.into() })).into_response()
}

fn internal_error(e: &StoreError, operation: &'static str) -> Response {
    error!(error = %e, operation, "store operation failed");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "SERVER_ERROR",
        "internal error",
    )
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Response {
    let username_chars = body.username.chars().count();
    if username_chars < MIN_USERNAME_CHARS || username_chars > MAX_USERNAME_CHARS {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_USERNAME",
            format!("username must be {MIN_USERNAME_CHARS}..={MAX_USERNAME_CHARS} characters"),
        );
    }
    if body.email.is_empty() || !body.email.contains('@') {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_EMAIL", "invalid email");
    }
    if body.password.len() < MIN_PASSWORD_BYTES {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_PASSWORD",
            format!("password must be at least {MIN_PASSWORD_BYTES} bytes"),
        );
    }

    let (user, token, joined) = {
        let mut store = state.store.lock().await;
        let salt = auth::new_salt();
        let hash = auth::hash_password(&body.password, &salt);
        let user =
            match store.create_user(&body.username, &body.username, &body.email, &hash, &salt) {
                Ok(user) => user,
                Err(StoreError::Conflict) => {
                    return error_response(
                        StatusCode::CONFLICT,
                        "TAKEN",
                        "username or email already taken",
                    );
                }
                Err(e) => return internal_error(&e, "create_user"),
            };
        let (token, _session) = match auth::issue_session(&store, user.id) {
            Ok(issued) => issued,
            Err(e) => return internal_error(&e, "issue_session"),
        };
        let joined = match store.server_by_name(DEFAULT_SERVER_NAME) {
            Ok(Some(server)) => match store.add_member(server.id, user.id) {
                Ok(member) => Some((server.id, member)),
                Err(e) => {
                    error!(error = %e, "failed to join default server");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => return internal_error(&e, "server_by_name"),
        };
        (user, token, joined)
    };

    info!(username = %user.username, user_id = %user.id, "registered user");
    if let Some((server_id, member)) = joined {
        state
            .hub
            .dispatch(
                Target::Server(server_id),
                Event::ServerMemberAdd(ServerMemberAddPayload {
                    server_id,
                    profile: concord_protocol::MemberProfile { member, user: user.clone() },
                }),
            )
            .await;
    }
    (StatusCode::OK, Json(AuthResponse { user, token })).into_response()
}

pub async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> Response {
    let store = state.store.lock().await;
    let creds = match store.credentials_by_email(&body.email) {
        Ok(creds) => creds,
        Err(e) => return internal_error(&e, "credentials_by_email"),
    };
    let Some((user_id, stored_hash, salt)) = creds else {
        return error_response(StatusCode::UNAUTHORIZED, "BAD_LOGIN", "bad email or password");
    };
    if auth::hash_password(&body.password, &salt) != stored_hash {
        return error_response(StatusCode::UNAUTHORIZED, "BAD_LOGIN", "bad email or password");
    }
    let user = match store.user_by_id(user_id) {
        Ok(Some(user)) => user,
        Ok(None) => {
            return error_response(StatusCode::UNAUTHORIZED, "BAD_LOGIN", "bad email or password")
        }
        Err(e) => return internal_error(&e, "user_by_id"),
    };
    let (token, _session) = match auth::issue_session(&store, user.id) {
        Ok(issued) => issued,
        Err(e) => return internal_error(&e, "issue_session"),
    };
    info!(user_id = %user.id, "login");
    (StatusCode::OK, Json(AuthResponse { user, token })).into_response()
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub time: chrono::DateTime<Utc>,
}

pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok", time: Utc::now() })
}
