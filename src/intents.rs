//! Gateway intents
//!
//! An intent bitmask selects which event categories a shard subscribes to.
//! One value is shared read-only by every shard of a manager.

use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

/// Intent bitmask sent in the identify payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Intents(u32);

impl Intents {
    pub const NONE: Self = Self(0);
    /// Guild, channel lifecycle
    pub const GUILDS: Self = Self(1 << 0);
    /// Guild member add/update/remove
    pub const GUILD_MEMBERS: Self = Self(1 << 1);
    /// Every guild message (private bots only)
    pub const GUILD_MESSAGES: Self = Self(1 << 9);
    pub const GUILD_MESSAGE_REACTIONS: Self = Self(1 << 10);
    pub const DIRECT_MESSAGE: Self = Self(1 << 12);
    /// Group @-messages and one-to-one chat
    pub const GROUP_AND_C2C: Self = Self(1 << 25);
    pub const INTERACTION: Self = Self(1 << 26);
    pub const MESSAGE_AUDIT: Self = Self(1 << 27);
    pub const FORUMS: Self = Self(1 << 28);
    pub const AUDIO_ACTION: Self = Self(1 << 29);
    /// Messages that @-mention the bot in public guilds
    pub const PUBLIC_GUILD_MESSAGES: Self = Self(1 << 30);

    const NAMED: [(&'static str, Intents); 11] = [
        ("guilds", Self::GUILDS),
        ("guild_members", Self::GUILD_MEMBERS),
        ("guild_messages", Self::GUILD_MESSAGES),
        ("guild_message_reactions", Self::GUILD_MESSAGE_REACTIONS),
        ("direct_message", Self::DIRECT_MESSAGE),
        ("group_and_c2c", Self::GROUP_AND_C2C),
        ("interaction", Self::INTERACTION),
        ("message_audit", Self::MESSAGE_AUDIT),
        ("forums", Self::FORUMS),
        ("audio_action", Self::AUDIO_ACTION),
        ("public_guild_messages", Self::PUBLIC_GUILD_MESSAGES),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Default subscription for a public bot
    pub const fn public_default() -> Self {
        Self(Self::GUILDS.0 | Self::PUBLIC_GUILD_MESSAGES.0)
    }
}

impl BitOr for Intents {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Intents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Intents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

/// Parses either a decimal bitmask (`1073741825`) or comma-separated
/// names (`guilds,public_guild_messages`).
impl FromStr for Intents {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(bits) = s.parse::<u32>() {
            return Ok(Self(bits));
        }

        let mut intents = Self::NONE;
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let name = name.to_ascii_lowercase();
            let (_, flag) = Self::NAMED
                .iter()
                .find(|(known, _)| *known == name)
                .ok_or_else(|| GatewayError::Config(format!("unknown intent '{name}'")))?;
            intents |= *flag;
        }
        Ok(intents)
    }
}
