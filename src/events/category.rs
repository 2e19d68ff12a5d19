//! Event model delivered to application handlers

use crate::error::GatewayError;
use serde::Serialize;
use serde_json::Value;

/// Handler routing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// READY / RESUMED
    Session,
    Guild,
    GuildMember,
    Channel,
    Message,
    MessageReaction,
    DirectMessage,
    AtMessage,
    MessageAudit,
    Interaction,
    Audio,
    Forum,
    GroupAndC2C,
    Other,
    /// Shard lifecycle notices produced by this crate
    Lifecycle,
    /// Wildcard: receives every event after the category handlers
    All,
}

impl EventCategory {
    /// Map a dispatch event type to its category
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type {
            "READY" | "RESUMED" => Self::Session,
            "AT_MESSAGE_CREATE" | "PUBLIC_MESSAGE_DELETE" => Self::AtMessage,
            "INTERACTION_CREATE" => Self::Interaction,
            t if t.starts_with("GUILD_MEMBER_") => Self::GuildMember,
            t if t.starts_with("GUILD_") => Self::Guild,
            t if t.starts_with("CHANNEL_") => Self::Channel,
            t if t.starts_with("MESSAGE_REACTION_") => Self::MessageReaction,
            t if t.starts_with("MESSAGE_AUDIT_") => Self::MessageAudit,
            t if t.starts_with("MESSAGE_") => Self::Message,
            t if t.starts_with("DIRECT_MESSAGE_") => Self::DirectMessage,
            t if t.starts_with("AUDIO_") => Self::Audio,
            t if t.starts_with("FORUM_") || t.starts_with("OPEN_FORUM_") => Self::Forum,
            t if t.starts_with("C2C_")
                || t.starts_with("GROUP_")
                || t.starts_with("FRIEND_") =>
            {
                Self::GroupAndC2C
            }
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Guild => "guild",
            Self::GuildMember => "guild_member",
            Self::Channel => "channel",
            Self::Message => "message",
            Self::MessageReaction => "message_reaction",
            Self::DirectMessage => "direct_message",
            Self::AtMessage => "at_message",
            Self::MessageAudit => "message_audit",
            Self::Interaction => "interaction",
            Self::Audio => "audio",
            Self::Forum => "forum",
            Self::GroupAndC2C => "group_and_c2c",
            Self::Other => "other",
            Self::Lifecycle => "lifecycle",
            Self::All => "all",
        }
    }
}

/// A decoded dispatch frame
#[derive(Debug, Clone, Serialize)]
pub struct DispatchEvent {
    pub shard_id: u32,
    pub sequence: Option<u64>,
    pub event_type: String,
    /// Platform event id, or a generated UUID when absent
    pub event_id: String,
    pub data: Value,
}

impl DispatchEvent {
    pub fn category(&self) -> EventCategory {
        EventCategory::from_event_type(&self.event_type)
    }
}

/// How a shard run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardExit {
    /// Stopped by the manager
    Stopped,
    /// Credentials or intents rejected; not retried
    FatalAuth { code: u16, reason: String },
    /// Reconnect budget exhausted
    Failed { attempts: u32, reason: String },
}

impl ShardExit {
    /// Error to surface to the application, `None` for a clean stop
    pub fn into_error(self, shard_id: u32) -> Option<GatewayError> {
        match self {
            ShardExit::Stopped => None,
            ShardExit::FatalAuth { code, reason } => Some(GatewayError::FatalAuth {
                shard_id,
                code,
                reason,
            }),
            ShardExit::Failed { attempts, reason } => Some(GatewayError::ShardFailed {
                shard_id,
                attempts,
                reason,
            }),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ShardExit::Stopped => "stopped",
            ShardExit::FatalAuth { .. } => "fatal_auth",
            ShardExit::Failed { .. } => "failed",
        }
    }
}

/// Shard lifecycle notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Ready { shard_id: u32, session_id: String },
    Resumed { shard_id: u32, session_id: String, sequence: u64 },
    Disconnected { shard_id: u32, resumable: bool, reason: String },
    Closed { shard_id: u32, exit: ShardExit },
}

impl LifecycleEvent {
    pub fn shard_id(&self) -> u32 {
        match self {
            LifecycleEvent::Ready { shard_id, .. }
            | LifecycleEvent::Resumed { shard_id, .. }
            | LifecycleEvent::Disconnected { shard_id, .. }
            | LifecycleEvent::Closed { shard_id, .. } => *shard_id,
        }
    }
}

/// Everything a handler can receive
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Event {
    Dispatch(DispatchEvent),
    Lifecycle(LifecycleEvent),
}

impl Event {
    pub fn category(&self) -> EventCategory {
        match self {
            Event::Dispatch(dispatch) => dispatch.category(),
            Event::Lifecycle(_) => EventCategory::Lifecycle,
        }
    }

    pub fn shard_id(&self) -> u32 {
        match self {
            Event::Dispatch(dispatch) => dispatch.shard_id,
            Event::Lifecycle(lifecycle) => lifecycle.shard_id(),
        }
    }

    pub fn as_dispatch(&self) -> Option<&DispatchEvent> {
        match self {
            Event::Dispatch(dispatch) => Some(dispatch),
            Event::Lifecycle(_) => None,
        }
    }

    pub fn as_lifecycle(&self) -> Option<&LifecycleEvent> {
        match self {
            Event::Lifecycle(lifecycle) => Some(lifecycle),
            Event::Dispatch(_) => None,
        }
    }
}
