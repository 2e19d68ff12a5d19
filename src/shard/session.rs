//! Shard identity and resumable session state

use serde::Serialize;

/// Which slice of the gateway a connection serves. Fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ShardSpec {
    pub shard_id: u32,
    pub total_shards: u32,
}

impl ShardSpec {
    pub fn new(shard_id: u32, total_shards: u32) -> Self {
        Self {
            shard_id,
            total_shards,
        }
    }
}

/// Resume state of one shard
///
/// Created by READY, advanced by every dispatch, discarded once the platform
/// refuses to resume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    session_id: String,
    last_sequence: u64,
    resume_url: Option<String>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, sequence: Option<u64>, resume_url: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            last_sequence: sequence.unwrap_or(0),
            resume_url: resume_url.filter(|url| url.starts_with("wss://") || url.starts_with("ws://")),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    /// Record a dispatch sequence. Returns false for a sequence at or below
    /// the current one (replayed duplicate); the sequence never moves back.
    pub fn advance(&mut self, sequence: u64) -> bool {
        if sequence > self.last_sequence {
            self.last_sequence = sequence;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let mut session = SessionState::new("abc", Some(1), None);
        assert!(session.advance(2));
        assert!(session.advance(5));
        assert!(!session.advance(5));
        assert!(!session.advance(3));
        assert_eq!(session.last_sequence(), 5);
    }

    #[test]
    fn test_resume_url_must_be_websocket() {
        let session = SessionState::new("abc", None, Some("https://example.com".to_string()));
        assert_eq!(session.resume_url(), None);
        assert_eq!(session.last_sequence(), 0);

        let session = SessionState::new("abc", None, Some("wss://resume.example".to_string()));
        assert_eq!(session.resume_url(), Some("wss://resume.example"));
    }
}
