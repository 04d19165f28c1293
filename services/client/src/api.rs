//! Short-lived HTTP calls against a server's `/api` surface, used by the
//! auto-connect flow before any WebSocket exists.

use concord_protocol::User;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{status}: {message}")]
    Rejected { status: u16, message: String },
}

impl ApiError {
    /// Login failures fall through to registration; transport failures
    /// do not.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ApiError::Rejected { .. })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Clone)]
pub struct AuthApi {
    http: reqwest::Client,
    base: String,
}

impl AuthApi {
    /// `base` is the scheme+host+port half of the server's address, e.g.
    /// `https://chat.example.com:8443`.
    pub fn new(base: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), base: base.into() }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ApiError> {
        self.post(
            "/api/login",
            &serde_json::json!({ "email": email, "password": password }),
        )
        .await
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, ApiError> {
        self.post(
            "/api/register",
            &serde_json::json!({ "username": username, "email": email, "password": password }),
        )
        .await
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<AuthResponse, ApiError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_default();
        Err(ApiError::Rejected { status: status.as_u16(), message })
    }
}
