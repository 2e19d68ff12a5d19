//! Gateway wire protocol
//!
//! JSON text frames with a `{op, d, s, t, id}` envelope. Only the frames the
//! session lifecycle needs are modelled; dispatch payloads stay opaque.

use crate::error::GatewayError;
use crate::intents::Intents;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway opcodes
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
    pub const HTTP_CALLBACK_ACK: u8 = 12;
}

/// Close codes with a fixed meaning
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const INVALID_SESSION: u16 = 4006;
    pub const INVALID_SEQ: u16 = 4007;
    pub const RATE_LIMITED: u16 = 4008;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_VERSION: u16 = 4012;
    pub const INVALID_INTENTS: u16 = 4013;
    pub const DISALLOWED_INTENTS: u16 = 4014;
    pub const INTERNAL_FIRST: u16 = 4900;
    pub const INTERNAL_LAST: u16 = 4913;
    pub const BOT_OFFLINE: u16 = 4914;
    pub const BOT_BANNED: u16 = 4915;
}

/// Dispatch event types the session layer reacts to
pub mod event_type {
    pub const READY: &str = "READY";
    pub const RESUMED: &str = "RESUMED";
}

/// What a close code asks the shard to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Credentials, shard layout or intents are wrong; never retry
    Fatal,
    /// Session is gone; reconnect with a fresh identify
    Reidentify,
    /// Reconnect and resume the session
    Resume,
}

pub fn classify_close(code: u16) -> CloseAction {
    use close_code::*;

    match code {
        AUTHENTICATION_FAILED | INVALID_SHARD | SHARDING_REQUIRED | INVALID_VERSION
        | INVALID_INTENTS | DISALLOWED_INTENTS | BOT_OFFLINE | BOT_BANNED => CloseAction::Fatal,
        NORMAL | GOING_AWAY | INVALID_SESSION | INVALID_SEQ => CloseAction::Reidentify,
        INTERNAL_FIRST..=INTERNAL_LAST => CloseAction::Reidentify,
        _ => CloseAction::Resume,
    }
}

/// Frame envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl GatewayPayload {
    fn command(op: u8, d: Value) -> Self {
        Self {
            op,
            d: Some(d),
            s: None,
            t: None,
            id: None,
        }
    }

    pub fn to_json(&self) -> Result<String, GatewayError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelloPayload {
    /// Milliseconds
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub user: Option<Value>,
}

#[derive(Debug, Serialize)]
struct IdentifyProperties {
    #[serde(rename = "$os")]
    os: &'static str,
    #[serde(rename = "$browser")]
    browser: &'static str,
    #[serde(rename = "$device")]
    device: &'static str,
}

#[derive(Debug, Serialize)]
struct Identify<'a> {
    token: &'a str,
    intents: Intents,
    shard: [u32; 2],
    properties: IdentifyProperties,
}

#[derive(Debug, Serialize)]
struct Resume<'a> {
    token: &'a str,
    session_id: &'a str,
    seq: u64,
}

pub fn build_identify(token: &str, intents: Intents, shard_id: u32, total_shards: u32) -> GatewayPayload {
    let identify = Identify {
        token,
        intents,
        shard: [shard_id, total_shards],
        properties: IdentifyProperties {
            os: std::env::consts::OS,
            browser: env!("CARGO_PKG_NAME"),
            device: env!("CARGO_PKG_NAME"),
        },
    };
    GatewayPayload::command(opcode::IDENTIFY, serde_json::json!(identify))
}

pub fn build_resume(token: &str, session_id: &str, seq: u64) -> GatewayPayload {
    GatewayPayload::command(
        opcode::RESUME,
        serde_json::json!(Resume {
            token,
            session_id,
            seq,
        }),
    )
}

pub fn build_heartbeat(last_sequence: Option<u64>) -> GatewayPayload {
    GatewayPayload::command(opcode::HEARTBEAT, serde_json::json!(last_sequence))
}

/// Inbound frame, decoded into the categories the state machine handles
#[derive(Debug, Clone)]
pub enum GatewayFrame {
    Hello(HelloPayload),
    Dispatch {
        sequence: Option<u64>,
        event_type: String,
        event_id: Option<String>,
        data: Value,
    },
    /// Server asks for an immediate heartbeat
    Heartbeat,
    HeartbeatAck,
    Reconnect,
    InvalidSession { resumable: bool },
    /// Opcodes the session layer does not act on
    Other { op: u8 },
}

impl GatewayFrame {
    pub fn decode(text: &str) -> Result<Self, GatewayError> {
        let payload: GatewayPayload = serde_json::from_str(text)?;
        Self::from_payload(payload)
    }

    pub fn from_payload(payload: GatewayPayload) -> Result<Self, GatewayError> {
        let frame = match payload.op {
            opcode::HELLO => {
                let data = payload.d.unwrap_or(Value::Null);
                Self::Hello(serde_json::from_value(data)?)
            }
            opcode::DISPATCH => Self::Dispatch {
                sequence: payload.s,
                event_type: payload.t.unwrap_or_default(),
                event_id: payload.id,
                data: payload.d.unwrap_or(Value::Null),
            },
            opcode::HEARTBEAT => Self::Heartbeat,
            opcode::HEARTBEAT_ACK => Self::HeartbeatAck,
            opcode::RECONNECT => Self::Reconnect,
            opcode::INVALID_SESSION => Self::InvalidSession {
                resumable: payload.d.as_ref().and_then(Value::as_bool).unwrap_or(false),
            },
            op => Self::Other { op },
        };
        Ok(frame)
    }
}
