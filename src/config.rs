//! Gateway configuration module
//!
//! Handles loading configuration from environment variables. Parsing goes
//! through a lookup function so tests never touch the process environment.

use crate::error::GatewayError;
use crate::intents::Intents;
use crate::rest::DEFAULT_API_BASE;
use crate::token::{Token, TokenType};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default app access token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://bots.qq.com/app/getAppAccessToken";

/// Reconnect, heartbeat and shutdown policy
///
/// These are platform conventions rather than invariants, so all of them
/// are tunable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Bound on opening one transport
    pub dial_timeout: Duration,
    /// Bound on Hello and on identify/resume completing
    pub handshake_timeout: Duration,
    /// Consecutive failed connection cycles before the shard gives up
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive unacknowledged heartbeats that mark a connection stale
    pub heartbeat_miss_threshold: u32,
    /// Rolling window for `max_concurrency` identifies
    pub identify_window: Duration,
    /// Bound on stop waiting for every shard
    pub shutdown_timeout: Duration,
    /// Supervisor restarts of a shard that exhausted its reconnect budget
    pub max_shard_restarts: u32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(60_000),
            heartbeat_miss_threshold: 2,
            identify_window: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            max_shard_restarts: 0,
        }
    }
}

impl SessionPolicy {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let secs = |key: &str, default: Duration| -> Result<Duration, GatewayError> {
            parse_or(&lookup, key, default.as_secs()).map(Duration::from_secs)
        };
        let millis = |key: &str, default: Duration| -> Result<Duration, GatewayError> {
            parse_or(&lookup, key, default.as_millis() as u64).map(Duration::from_millis)
        };

        let policy = Self {
            dial_timeout: secs("DIAL_TIMEOUT_SECS", defaults.dial_timeout)?,
            handshake_timeout: secs("HANDSHAKE_TIMEOUT_SECS", defaults.handshake_timeout)?,
            max_reconnect_attempts: parse_or(
                &lookup,
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            backoff_base: millis("BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_max: millis("BACKOFF_MAX_MS", defaults.backoff_max)?,
            heartbeat_miss_threshold: parse_or(
                &lookup,
                "HEARTBEAT_MISS_THRESHOLD",
                defaults.heartbeat_miss_threshold,
            )?,
            identify_window: secs("IDENTIFY_WINDOW_SECS", defaults.identify_window)?,
            shutdown_timeout: secs("SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout)?,
            max_shard_restarts: parse_or(&lookup, "MAX_SHARD_RESTARTS", defaults.max_shard_restarts)?,
        };

        if policy.max_reconnect_attempts == 0 {
            return Err(GatewayError::Config(
                "MAX_RECONNECT_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if policy.heartbeat_miss_threshold == 0 {
            return Err(GatewayError::Config(
                "HEARTBEAT_MISS_THRESHOLD must be at least 1".to_string(),
            ));
        }

        Ok(policy)
    }
}

/// How the bot authenticates
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Fixed token
    Static(Token),
    /// App id + client secret exchanged for short-lived access tokens
    AppSecret {
        app_id: u64,
        client_secret: String,
        token_url: String,
    },
}

/// Optional pool slicing of the shard id space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub pool_id: u32,
    pub shards_per_pool: u32,
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub credentials: Credentials,

    /// REST API base used for gateway info
    pub api_base_url: String,

    pub intents: Intents,

    /// Overrides the recommended shard count
    pub total_shards: Option<u32>,

    /// Run only one pool's slice of shards
    pub pool: Option<PoolConfig>,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    pub policy: SessionPolicy,
}

impl GatewayConfig {
    /// Load configuration from environment variables (and `.env`)
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let app_id: u64 = parse_or(&lookup, "BOT_APP_ID", 0)?;

        let credentials = match lookup("BOT_CLIENT_SECRET") {
            Some(client_secret) => {
                if app_id == 0 {
                    return Err(GatewayError::Config(
                        "BOT_APP_ID must be set when BOT_CLIENT_SECRET is used".to_string(),
                    ));
                }
                Credentials::AppSecret {
                    app_id,
                    client_secret,
                    token_url: lookup("TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
                }
            }
            None => {
                let secret = lookup("BOT_TOKEN").ok_or_else(|| {
                    GatewayError::Config("BOT_TOKEN or BOT_CLIENT_SECRET must be set".to_string())
                })?;
                let kind = lookup("BOT_TOKEN_TYPE")
                    .map(|t| t.parse::<TokenType>())
                    .transpose()?
                    .unwrap_or(TokenType::Bot);
                let token = Token::new(kind, app_id, secret);
                token
                    .validate()
                    .map_err(|e| GatewayError::Config(e.to_string()))?;
                Credentials::Static(token)
            }
        };

        let intents = match lookup("BOT_INTENTS") {
            Some(raw) => raw.parse()?,
            None => Intents::public_default(),
        };
        if intents.is_empty() {
            return Err(GatewayError::Config("BOT_INTENTS must not be empty".to_string()));
        }

        let total_shards = match lookup("TOTAL_SHARDS") {
            Some(raw) => Some(raw.trim().parse::<u32>().map_err(|e| {
                GatewayError::Config(format!("TOTAL_SHARDS must be a valid number: {e}"))
            })?),
            None => None,
        }
        .filter(|n| *n > 0);

        let pool = match lookup("POOL_ID") {
            Some(raw) => {
                let pool_id = raw.trim().parse().map_err(|e| {
                    GatewayError::Config(format!("POOL_ID must be a valid number: {e}"))
                })?;
                let shards_per_pool = parse_or(&lookup, "SHARDS_PER_POOL", 25)?;
                if shards_per_pool == 0 {
                    return Err(GatewayError::Config(
                        "SHARDS_PER_POOL must be at least 1".to_string(),
                    ));
                }
                Some(PoolConfig {
                    pool_id,
                    shards_per_pool,
                })
            }
            None => None,
        };

        Ok(Self {
            credentials,
            api_base_url: lookup("API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            intents,
            total_shards,
            pool,
            http_port: parse_or(&lookup, "HTTP_PORT", 9090)?,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            policy: SessionPolicy::from_lookup(&lookup)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, GatewayError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GatewayError::Config(format!("{key} must be a valid value: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("BOT_APP_ID", "1024"),
            ("BOT_TOKEN", "secret"),
        ]))
        .unwrap();

        assert!(matches!(config.credentials, Credentials::Static(ref t) if t.authorization() == "Bot 1024.secret"));
        assert_eq!(config.api_base_url, DEFAULT_API_BASE);
        assert_eq!(config.intents, Intents::public_default());
        assert_eq!(config.total_shards, None);
        assert_eq!(config.pool, None);
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.policy, SessionPolicy::default());
    }

    #[test]
    fn test_intents_are_minimal_by_default() {
        let intents = Intents::public_default();
        assert!(intents.contains(Intents::GUILDS));
        assert!(intents.contains(Intents::PUBLIC_GUILD_MESSAGES));
        // Private-bot intent stays off unless asked for
        assert!(!intents.contains(Intents::GUILD_MESSAGES));
    }

    #[test]
    fn test_missing_token_is_config_error() {
        let err = GatewayConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration error: BOT_TOKEN or BOT_CLIENT_SECRET must be set"
        );
    }

    #[test]
    fn test_client_secret_selects_app_token_flow() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("BOT_APP_ID", "1024"),
            ("BOT_CLIENT_SECRET", "shh"),
            ("POOL_ID", "2"),
            ("SHARDS_PER_POOL", "10"),
            ("TOTAL_SHARDS", "40"),
        ]))
        .unwrap();

        assert!(matches!(
            config.credentials,
            Credentials::AppSecret { app_id: 1024, ref token_url, .. } if token_url == DEFAULT_TOKEN_URL
        ));
        assert_eq!(
            config.pool,
            Some(PoolConfig {
                pool_id: 2,
                shards_per_pool: 10
            })
        );
        assert_eq!(config.total_shards, Some(40));
    }

    #[test]
    fn test_policy_overrides_and_validation() {
        let policy = SessionPolicy::from_lookup(lookup(&[
            ("MAX_RECONNECT_ATTEMPTS", "3"),
            ("BACKOFF_BASE_MS", "250"),
            ("HEARTBEAT_MISS_THRESHOLD", "3"),
        ]))
        .unwrap();
        assert_eq!(policy.max_reconnect_attempts, 3);
        assert_eq!(policy.backoff_base, Duration::from_millis(250));
        assert_eq!(policy.heartbeat_miss_threshold, 3);

        let err = SessionPolicy::from_lookup(lookup(&[("HEARTBEAT_MISS_THRESHOLD", "0")]));
        assert!(err.is_err());

        let err = SessionPolicy::from_lookup(lookup(&[("DIAL_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("DIAL_TIMEOUT_SECS"));
    }

    #[test]
    fn test_named_intents_and_token_type() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("BOT_TOKEN", "abc"),
            ("BOT_TOKEN_TYPE", "bearer"),
            ("BOT_INTENTS", "guilds,interaction"),
        ]))
        .unwrap();
        assert_eq!(config.intents, Intents::GUILDS | Intents::INTERACTION);
        assert!(matches!(config.credentials, Credentials::Static(ref t) if t.authorization() == "Bearer abc"));
    }
}
