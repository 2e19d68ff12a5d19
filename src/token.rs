//! Credentials and token providers
//!
//! A `Token` is an immutable value; refreshing produces a new one. Shards
//! ask their `TokenSource` for a token on every identify and resume so a
//! refreshed credential is picked up after a reconnect.

use crate::error::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Refresh an app access token this long before it expires
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Authorization scheme of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// `Bot {app_id}.{secret}`
    Bot,
    /// `Bearer {secret}`
    Bearer,
    /// `QQBot {access_token}`, issued by the app access token endpoint
    QQBot,
}

impl std::str::FromStr for TokenType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bot" => Ok(Self::Bot),
            "bearer" => Ok(Self::Bearer),
            "qqbot" => Ok(Self::QQBot),
            other => Err(GatewayError::Config(format!("unknown token type '{other}'"))),
        }
    }
}

/// Bot credential
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    kind: TokenType,
    app_id: u64,
    secret: String,
}

impl Token {
    pub fn bot(app_id: u64, secret: impl Into<String>) -> Self {
        Self {
            kind: TokenType::Bot,
            app_id,
            secret: secret.into(),
        }
    }

    pub fn bearer(secret: impl Into<String>) -> Self {
        Self {
            kind: TokenType::Bearer,
            app_id: 0,
            secret: secret.into(),
        }
    }

    pub fn qqbot(app_id: u64, access_token: impl Into<String>) -> Self {
        Self {
            kind: TokenType::QQBot,
            app_id,
            secret: access_token.into(),
        }
    }

    pub fn new(kind: TokenType, app_id: u64, secret: impl Into<String>) -> Self {
        Self {
            kind,
            app_id,
            secret: secret.into(),
        }
    }

    pub fn kind(&self) -> TokenType {
        self.kind
    }

    pub fn app_id(&self) -> u64 {
        self.app_id
    }

    /// Value for the `Authorization` header and the identify/resume `token` field
    pub fn authorization(&self) -> String {
        match self.kind {
            TokenType::Bot => format!("Bot {}.{}", self.app_id, self.secret),
            TokenType::Bearer => format!("Bearer {}", self.secret),
            TokenType::QQBot => format!("QQBot {}", self.secret),
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.secret.trim().is_empty() {
            return Err(GatewayError::Token("token secret is empty".to_string()));
        }
        if self.kind == TokenType::Bot && self.app_id == 0 {
            return Err(GatewayError::Token("bot token requires an app id".to_string()));
        }
        Ok(())
    }
}

// Keep secrets out of logs
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("kind", &self.kind)
            .field("app_id", &self.app_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Provides a valid token on demand
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<Token, GatewayError>;
}

#[async_trait]
impl TokenSource for Token {
    async fn token(&self) -> Result<Token, GatewayError> {
        self.validate()?;
        Ok(self.clone())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenRequest<'a> {
    app_id: String,
    client_secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    #[serde(deserialize_with = "seconds_from_number_or_string")]
    expires_in: u64,
}

/// The token endpoint returns `expires_in` as a numeric string
fn seconds_from_number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

struct CachedToken {
    token: Token,
    expires_at: Instant,
}

/// Exchanges app id + client secret for short-lived `QQBot` access tokens
pub struct AppAccessTokenSource {
    http: reqwest::Client,
    endpoint: String,
    app_id: u64,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl AppAccessTokenSource {
    pub fn new(
        endpoint: impl Into<String>,
        app_id: u64,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            app_id,
            client_secret: client_secret.into(),
            cached: Mutex::new(None),
        })
    }

    /// Drop the cached token so the next call refreshes
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn refresh(&self) -> Result<CachedToken, GatewayError> {
        debug!(app_id = self.app_id, "Refreshing app access token");

        let response = self
            .http
            .post(&self.endpoint)
            .json(&AccessTokenRequest {
                app_id: self.app_id.to_string(),
                client_secret: &self.client_secret,
            })
            .send()
            .await
            .map_err(|e| GatewayError::Token(format!("access token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Token(format!(
                "access token endpoint returned {status}"
            )));
        }

        let body: AccessTokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Token(format!("access token response malformed: {e}")))?;

        let token = Token::qqbot(self.app_id, body.access_token);
        token.validate()?;

        info!(
            app_id = self.app_id,
            expires_in = body.expires_in,
            "App access token refreshed"
        );

        Ok(CachedToken {
            token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        })
    }
}

#[async_trait]
impl TokenSource for AppAccessTokenSource {
    async fn token(&self) -> Result<Token, GatewayError> {
        let mut cached = self.cached.lock().await;

        if let Some(current) = cached.as_ref() {
            if Instant::now() + REFRESH_MARGIN < current.expires_at {
                return Ok(current.token.clone());
            }
        }

        let fresh = self.refresh().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }
}
