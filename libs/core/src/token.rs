//! Bearer credential lifecycle for the upstream Direct Line service.
//!
//! A [`TokenProvider`] caches the last issued [`Token`] and only goes back to
//! its [`CredentialSource`] when fewer than [`SAFETY_MARGIN`] of validity
//! remain. Refreshes are single-flight: concurrent callers queue on the same
//! async mutex and observe the token minted by whoever got there first.

use std::{fmt, sync::Arc, time::Instant};

use async_trait::async_trait;
use http::StatusCode;
use metrics::counter;
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::directline_client::{retry_after, truncate_body};

/// Minimum remaining validity for a cached token to be handed out.
pub const SAFETY_MARGIN: Duration = Duration::seconds(60);

const DEFAULT_EXPIRES_IN_SECS: u64 = 1_800;

#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    expires_at: Option<OffsetDateTime>,
}

impl Token {
    pub fn new(value: impl Into<String>, expires_at: OffsetDateTime) -> Self {
        Self {
            value: value.into(),
            expires_at: Some(expires_at),
        }
    }

    /// A credential with no upstream expiry, e.g. a raw channel secret.
    pub fn non_expiring(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    /// A credential valid for `ttl_secs` from `now`. A lifetime too large to
    /// represent as a date is treated as non-expiring.
    pub fn expiring_in(value: impl Into<String>, now: OffsetDateTime, ttl_secs: u64) -> Self {
        let expires_at = i64::try_from(ttl_secs)
            .ok()
            .and_then(|secs| now.checked_add(Duration::seconds(secs)));
        Self {
            value: value.into(),
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at
    }

    pub fn is_fresh_at(&self, now: OffsetDateTime) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - now > SAFETY_MARGIN,
            None => true,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential configuration missing: {0}")]
    MissingConfiguration(&'static str),
    #[error("identity provider rejected the request (status {status})")]
    Rejected { status: StatusCode, body: String },
    #[error("identity provider unreachable")]
    Transport(#[source] reqwest::Error),
    #[error("identity provider response could not be decoded")]
    Decode(#[source] anyhow::Error),
}

/// Narrow interface to whatever mints upstream credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn issue(&self) -> Result<Token, CredentialError>;
}

pub type SharedCredentialSource = Arc<dyn CredentialSource>;

/// Uses the configured channel secret directly as the bearer credential.
pub struct StaticSecret {
    secret: String,
}

impl StaticSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticSecret {
    async fn issue(&self) -> Result<Token, CredentialError> {
        let secret = self.secret.trim();
        if secret.is_empty() {
            return Err(CredentialError::MissingConfiguration("direct line secret"));
        }
        Ok(Token::non_expiring(secret))
    }
}

/// Exchanges the channel secret for a short-lived token at a token endpoint
/// (`tokens/generate` or a Power Platform `directline/token` URL).
pub struct SecretExchange {
    client: Client,
    token_url: Url,
    secret: String,
}

impl SecretExchange {
    pub fn new(client: Client, token_url: Url, secret: impl Into<String>) -> Self {
        Self {
            client,
            token_url,
            secret: secret.into(),
        }
    }
}

#[derive(Deserialize)]
struct RawTokenResponse {
    token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[async_trait]
impl CredentialSource for SecretExchange {
    async fn issue(&self) -> Result<Token, CredentialError> {
        if self.secret.trim().is_empty() {
            return Err(CredentialError::MissingConfiguration("direct line secret"));
        }

        let response = self
            .client
            .post(self.token_url.clone())
            .bearer_auth(self.secret.trim())
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(CredentialError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let waited = retry_after(&response);
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".into());
            debug!(%status, retry_after = ?waited, "token endpoint rejected secret");
            return Err(CredentialError::Rejected {
                status,
                body: truncate_body(body),
            });
        }

        let raw = response
            .json::<RawTokenResponse>()
            .await
            .map_err(|err| CredentialError::Decode(err.into()))?;
        let ttl = raw.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        Ok(Token::expiring_in(raw.token, OffsetDateTime::now_utc(), ttl))
    }
}

/// Caching, single-flight front for a [`CredentialSource`].
pub struct TokenProvider {
    source: SharedCredentialSource,
    cached: Mutex<Option<Token>>,
}

impl TokenProvider {
    pub fn new(source: SharedCredentialSource) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<Token, CredentialError> {
        let mut guard = self.cached.lock().await;
        if let Some(token) = guard.as_ref()
            && token.is_fresh_at(OffsetDateTime::now_utc())
        {
            return Ok(token.clone());
        }

        let started = Instant::now();
        let token = self.source.issue().await.inspect_err(|err| {
            counter!("relay_errors_total", "kind" => "credential").increment(1);
            debug!(error = %err, "credential refresh failed");
        })?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            expires_at = ?token.expires_at(),
            "upstream credential refreshed"
        );
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Drops the cached token so the next call refreshes.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}
