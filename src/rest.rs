//! REST collaborator and gateway info resolution
//!
//! The only REST call the session core needs is `GET /gateway/bot`, which
//! returns the endpoint, the recommended shard count and the identify
//! rate-limit parameters.

use crate::error::GatewayError;
use crate::token::Token;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

/// Default REST API base
pub const DEFAULT_API_BASE: &str = "https://api.sgroup.qq.com";

/// Identify budget reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStartLimit {
    /// Identifies allowed per epoch
    pub total: u32,
    /// Identifies left in the current epoch
    pub remaining: u32,
    /// Time until the epoch resets
    pub reset_after: Duration,
    /// Identifies allowed per rate-limit window
    pub max_concurrency: u32,
}

/// Snapshot of gateway connection parameters, fetched once per start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Deserialize)]
struct GatewayBotResponse {
    url: String,
    shards: u32,
    session_start_limit: SessionStartLimitResponse,
}

#[derive(Debug, Deserialize)]
struct SessionStartLimitResponse {
    total: u32,
    remaining: u32,
    /// Milliseconds
    reset_after: u64,
    max_concurrency: u32,
}

impl From<GatewayBotResponse> for GatewayInfo {
    fn from(body: GatewayBotResponse) -> Self {
        Self {
            url: body.url,
            shards: body.shards,
            session_start_limit: SessionStartLimit {
                total: body.session_start_limit.total,
                remaining: body.session_start_limit.remaining,
                reset_after: Duration::from_millis(body.session_start_limit.reset_after),
                max_concurrency: body.session_start_limit.max_concurrency,
            },
        }
    }
}

/// Anything that can answer the gateway-info question
#[async_trait]
pub trait GatewayInfoSource: Send + Sync {
    async fn gateway_info(&self, token: &Token) -> Result<GatewayInfo, GatewayError>;
}

/// Minimal REST client for the gateway-info endpoint
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GatewayInfoSource for RestClient {
    async fn gateway_info(&self, token: &Token) -> Result<GatewayInfo, GatewayError> {
        let url = format!("{}/gateway/bot", self.base_url);

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, token.authorization())
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable {
                reason: format!("GET {url} failed"),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::upstream(format!("GET {url} returned {status}")));
        }

        let body: GatewayBotResponse =
            response
                .json()
                .await
                .map_err(|e| GatewayError::UpstreamUnavailable {
                    reason: "gateway info body malformed".to_string(),
                    source: Some(Box::new(e)),
                })?;

        Ok(body.into())
    }
}

/// Resolves gateway info once per manager start and rejects unusable answers
#[derive(Clone)]
pub struct GatewayResolver {
    source: std::sync::Arc<dyn GatewayInfoSource>,
}

impl GatewayResolver {
    pub fn new(source: std::sync::Arc<dyn GatewayInfoSource>) -> Self {
        Self { source }
    }

    /// Fetch and validate. No retries: the caller decides whether to restart.
    pub async fn resolve(&self, token: &Token) -> Result<GatewayInfo, GatewayError> {
        let info = self.source.gateway_info(token).await.map_err(|e| match e {
            upstream @ GatewayError::UpstreamUnavailable { .. } => upstream,
            other => GatewayError::UpstreamUnavailable {
                reason: "gateway info request failed".to_string(),
                source: Some(Box::new(other)),
            },
        })?;

        if !(info.url.starts_with("wss://") || info.url.starts_with("ws://")) {
            warn!(url = %info.url, "Gateway info returned a non-websocket url");
            return Err(GatewayError::upstream(format!(
                "gateway url '{}' is not a websocket url",
                info.url
            )));
        }
        if info.shards == 0 {
            return Err(GatewayError::upstream("gateway info recommends zero shards"));
        }
        if info.session_start_limit.max_concurrency == 0 {
            return Err(GatewayError::upstream("gateway info reports zero max_concurrency"));
        }

        info!(
            url = %info.url,
            shards = info.shards,
            remaining = info.session_start_limit.remaining,
            total = info.session_start_limit.total,
            max_concurrency = info.session_start_limit.max_concurrency,
            "Gateway info resolved"
        );

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::{routing::get, Json, Router};
    use std::sync::Arc;

    fn sample_info(url: &str, shards: u32, max_concurrency: u32) -> GatewayInfo {
        GatewayInfo {
            url: url.to_string(),
            shards,
            session_start_limit: SessionStartLimit {
                total: 1000,
                remaining: 1000,
                reset_after: Duration::from_secs(86_400),
                max_concurrency,
            },
        }
    }

    struct Fixed(GatewayInfo);

    #[async_trait]
    impl GatewayInfoSource for Fixed {
        async fn gateway_info(&self, _token: &Token) -> Result<GatewayInfo, GatewayError> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl GatewayInfoSource for Broken {
        async fn gateway_info(&self, _token: &Token) -> Result<GatewayInfo, GatewayError> {
            Err(GatewayError::Transport("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn test_resolver_rejects_malformed_info() {
        let token = Token::bot(1, "secret");
        for info in [
            sample_info("https://not-ws", 1, 1),
            sample_info("wss://gateway", 0, 1),
            sample_info("wss://gateway", 1, 0),
        ] {
            let resolver = GatewayResolver::new(Arc::new(Fixed(info)));
            let err = resolver.resolve(&token).await.unwrap_err();
            assert!(matches!(err, GatewayError::UpstreamUnavailable { .. }));
        }
    }

    #[tokio::test]
    async fn test_resolver_wraps_source_errors() {
        let resolver = GatewayResolver::new(Arc::new(Broken));
        let err = resolver.resolve(&Token::bot(1, "secret")).await.unwrap_err();
        assert_eq!(err.error_type_label(), "upstream_unavailable");
    }

    #[tokio::test]
    async fn test_rest_client_fetches_gateway_info() {
        let app = Router::new().route(
            "/gateway/bot",
            get(|headers: HeaderMap| async move {
                if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bot 7.s3cret")
                {
                    return Err(StatusCode::UNAUTHORIZED);
                }
                Ok(Json(serde_json::json!({
                    "url": "wss://api.sgroup.qq.com/websocket",
                    "shards": 4,
                    "session_start_limit": {
                        "total": 1000,
                        "remaining": 998,
                        "reset_after": 86400000,
                        "max_concurrency": 1
                    }
                })))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = RestClient::new(format!("http://{addr}/"), Duration::from_secs(5)).unwrap();

        let info = client.gateway_info(&Token::bot(7, "s3cret")).await.unwrap();
        assert_eq!(info.url, "wss://api.sgroup.qq.com/websocket");
        assert_eq!(info.shards, 4);
        assert_eq!(info.session_start_limit.remaining, 998);
        assert_eq!(info.session_start_limit.reset_after, Duration::from_secs(86_400));

        let err = client
            .gateway_info(&Token::bot(7, "wrong"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
