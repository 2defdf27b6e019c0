//! OAuth2 refresh-token authenticator for the QBO API.
//!
//! A `TokenAuthenticator` owns the only copy of the bearer token. It exchanges
//! the long-lived refresh token lazily, caches the access token until five
//! minutes before the server-declared expiry, and forgets it on `invalidate`.
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::AuthError;

const EXPIRY_MARGIN_SECS: i64 = 300;
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl BearerToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.value.is_empty() && now < self.expires_at
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Produces `Authorization` header values for API calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// `Bearer <token>`, refreshing first when the cached token is absent or stale.
    async fn auth_header(&self) -> Result<String, AuthError>;

    /// Drop the cached token so the next `auth_header` call refreshes.
    async fn invalidate(&self);
}

#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug)]
struct AuthState {
    token: Option<BearerToken>,
    refresh_token: String,
    rotated: Option<String>,
}

pub struct TokenAuthenticator {
    http: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    state: Mutex<AuthState>,
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}

impl TokenAuthenticator {
    pub fn new(
        credentials: Credentials,
        token_url: Url,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent("qbo-backfill/0.1")
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            token_url,
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            state: Mutex::new(AuthState {
                token: None,
                refresh_token: credentials.refresh_token,
                rotated: None,
            }),
        })
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let token_url = Url::parse(cfg.qbo.environment.token_url())?;
        let credentials = Credentials {
            client_id: cfg.qbo.client_id.clone(),
            client_secret: cfg.qbo.client_secret.clone(),
            refresh_token: cfg.qbo.refresh_token.clone(),
        };
        Ok(Self::new(
            credentials,
            token_url,
            cfg.extract.token_timeout(),
        )?)
    }

    /// Refresh token returned by the server when it differs from the configured one.
    /// The host must persist it; the configured credential is stale once this is set.
    pub async fn rotated_refresh_token(&self) -> Option<String> {
        self.state.lock().await.rotated.clone()
    }

    pub fn build_token_request(&self, refresh_token: &str) -> Result<reqwest::Request, AuthError> {
        self.http
            .post(self.token_url.clone())
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .build()
            .map_err(|e| AuthError::Transport(e.to_string()))
    }

    async fn exchange(&self, state: &mut AuthState) -> Result<BearerToken, AuthError> {
        let request = self.build_token_request(&state.refresh_token)?;
        info!(url = %request.url(), "requesting new access token");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if status != StatusCode::OK {
            warn!(status = status.as_u16(), "token exchange rejected");
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token = apply_token_response(state, &body, Utc::now())?;
        info!(expires_at = %token.expires_at, "access token obtained");
        Ok(token)
    }
}

/// Record a successful token response in `state` and return the new token.
fn apply_token_response(
    state: &mut AuthState,
    body: &str,
    now: DateTime<Utc>,
) -> Result<BearerToken, AuthError> {
    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|e| AuthError::Decode(e.to_string()))?;
    if parsed.access_token.is_empty() {
        return Err(AuthError::Decode("empty access_token".into()));
    }

    let lifetime = parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    let token = BearerToken {
        value: parsed.access_token,
        expires_at: now + ChronoDuration::seconds(lifetime - EXPIRY_MARGIN_SECS),
    };

    if let Some(new_refresh) = parsed.refresh_token.filter(|t| !t.is_empty()) {
        if new_refresh != state.refresh_token {
            warn!("server rotated the refresh token; update the stored QBO_REFRESH_TOKEN");
            state.refresh_token = new_refresh.clone();
            state.rotated = Some(new_refresh);
        }
    }

    state.token = Some(token.clone());
    Ok(token)
}

#[async_trait]
impl TokenSource for TokenAuthenticator {
    async fn auth_header(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.token.as_ref().filter(|t| t.is_valid_at(Utc::now())) {
            return Ok(format!("Bearer {}", token.value));
        }
        let token = self.exchange(&mut state).await?;
        Ok(format!("Bearer {}", token.value))
    }

    async fn invalidate(&self) {
        self.state.lock().await.token = None;
    }
}
