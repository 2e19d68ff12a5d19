//! Domain error types for the chat gateway
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, GatewayError>.

use std::time::Duration;
use thiserror::Error;

/// Gateway domain errors
///
/// Every variant carries structured context fields for diagnostics.
/// Transport and session-continuity variants are recovered inside the shard
/// state machine; the rest surface to the application.
///
/// Example log output:
/// ```text
/// GatewayError::ShardFailed { shard_id: 3, attempts: 5, reason: "..." }
/// → "shard 3 failed after 5 attempts: dial to wss://... failed"
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Gateway info could not be fetched or was malformed (fatal to start)
    #[error("gateway info unavailable: {reason}")]
    UpstreamUnavailable {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Opening the transport failed
    #[error("dial to {url} failed")]
    Dial {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Identify rejected for credential or intent reasons (never retried)
    #[error("shard {shard_id} authentication rejected (close code {code}): {reason}")]
    FatalAuth {
        shard_id: u32,
        code: u16,
        reason: String,
    },

    /// Platform invalidated the session; a fresh identify follows
    #[error("shard {shard_id} session invalidated")]
    SessionInvalid { shard_id: u32 },

    /// No identifies left for the current epoch and no reset time known
    #[error("identify limit exhausted for the current epoch")]
    LimitExhausted,

    /// Operation cancelled by stop
    #[error("operation cancelled")]
    Cancelled,

    /// Shard exhausted its reconnect budget
    #[error("shard {shard_id} failed after {attempts} attempts: {reason}")]
    ShardFailed {
        shard_id: u32,
        attempts: u32,
        reason: String,
    },

    /// Established transport broke or closed
    #[error("transport error: {0}")]
    Transport(String),

    /// A bounded wait ran out
    #[error("timed out waiting for {stage}")]
    Timeout { stage: &'static str },

    /// Inbound frame could not be decoded
    #[error("malformed gateway frame")]
    MalformedFrame(#[from] serde_json::Error),

    /// Token missing, invalid or refresh failed
    #[error("token error: {0}")]
    Token(String),

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// start called on a running manager
    #[error("session manager already started")]
    AlreadyStarted,

    /// stop did not see every shard finish in time
    #[error("shutdown did not complete within {timeout:?}")]
    ShutdownTimeout { timeout: Duration },

    /// Prometheus recorder could not be installed
    #[error("metrics recorder error: {0}")]
    Metrics(String),
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total` counter.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::Dial { .. } => "dial",
            Self::FatalAuth { .. } => "fatal_auth",
            Self::SessionInvalid { .. } => "session_invalid",
            Self::LimitExhausted => "limit_exhausted",
            Self::Cancelled => "cancelled",
            Self::ShardFailed { .. } => "shard_failed",
            Self::Transport(_) => "transport",
            Self::Timeout { .. } => "timeout",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::Token(_) => "token",
            Self::Config(_) => "config",
            Self::AlreadyStarted => "already_started",
            Self::ShutdownTimeout { .. } => "shutdown_timeout",
            Self::Metrics(_) => "metrics",
        }
    }

    /// Shorthand for an upstream failure without an underlying cause
    pub(crate) fn upstream(reason: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            reason: reason.into(),
            source: None,
        }
    }
}
