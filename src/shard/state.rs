//! Shard state tracking
//!
//! A reporting mirror of every shard's status. Each `ShardConnection` writes
//! only its own entry; the manager and the health endpoints read.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Connection status of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Disconnected,
    Connecting,
    Identifying,
    Resuming,
    Ready,
    /// Terminal: explicit stop, fatal auth error or exhausted retries
    Closing,
}

impl ShardStatus {
    /// Returns true if the shard is ready to receive events
    pub fn is_ready(&self) -> bool {
        matches!(self, ShardStatus::Ready)
    }

    /// Returns true while the shard is trying to (re)establish a session
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            ShardStatus::Connecting | ShardStatus::Identifying | ShardStatus::Resuming
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Disconnected => "disconnected",
            ShardStatus::Connecting => "connecting",
            ShardStatus::Identifying => "identifying",
            ShardStatus::Resuming => "resuming",
            ShardStatus::Ready => "ready",
            ShardStatus::Closing => "closing",
        }
    }
}

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub status: ShardStatus,
    pub session_id: Option<String>,
    pub last_sequence: Option<u64>,
    pub events_received: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_heartbeat_ack: Option<Instant>,
    pub connected_at: Option<Instant>,
    pub exit: Option<String>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            status: ShardStatus::Disconnected,
            session_id: None,
            last_sequence: None,
            events_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_heartbeat_ack: None,
            connected_at: None,
            exit: None,
        }
    }
}

/// Point-in-time copy of one shard's entry
#[derive(Debug, Clone, Serialize)]
pub struct ShardSnapshot {
    pub shard_id: u32,
    pub status: ShardStatus,
    pub session_id: Option<String>,
    pub last_sequence: Option<u64>,
    pub events_received: u64,
    pub reconnects: u64,
    pub exit: Option<String>,
}

/// Shared state across all shards of a manager
#[derive(Debug, Clone, Default)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug, Default)]
struct ShardStateInner {
    shards: DashMap<u32, ShardStateEntry>,
    total_shards: AtomicU32,
}

impl ShardState {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace tracked shards for a new start
    pub fn reset(&self, total_shards: u32, shard_ids: impl IntoIterator<Item = u32>) {
        self.inner.shards.clear();
        for shard_id in shard_ids {
            self.inner.shards.insert(shard_id, ShardStateEntry::default());
        }
        self.inner.total_shards.store(total_shards, Ordering::Relaxed);
    }

    /// Get total shards across the cluster
    pub fn total_shards(&self) -> u32 {
        self.inner.total_shards.load(Ordering::Relaxed)
    }

    /// Update shard status
    pub fn set_status(&self, shard_id: u32, status: ShardStatus) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.status = status;
            if status == ShardStatus::Ready && entry.connected_at.is_none() {
                entry.connected_at = Some(Instant::now());
            }
        }
    }

    /// Mirror the session id and sequence after READY / RESUMED / dispatch
    pub fn set_session(&self, shard_id: u32, session_id: Option<&str>, last_sequence: Option<u64>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.session_id = session_id.map(str::to_string);
            entry.last_sequence = last_sequence;
        }
    }

    /// Increment event received counter and mirror the sequence
    pub fn record_event(&self, shard_id: u32, sequence: Option<u64>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
            if sequence.is_some() {
                entry.last_sequence = sequence;
            }
        }
    }

    /// Increment reconnect counter
    pub fn record_reconnect(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record heartbeat acknowledgement
    pub fn record_heartbeat(&self, shard_id: u32) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.last_heartbeat_ack = Some(Instant::now());
        }
    }

    /// Record the final outcome of a shard run
    pub fn set_exit(&self, shard_id: u32, exit: Option<String>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.exit = exit;
        }
    }

    /// Get status for a specific shard
    pub fn get_status(&self, shard_id: u32) -> Option<ShardStatus> {
        self.inner.shards.get(&shard_id).map(|e| e.status)
    }

    /// Snapshot of one shard
    pub fn snapshot(&self, shard_id: u32) -> Option<ShardSnapshot> {
        self.inner.shards.get(&shard_id).map(|e| ShardSnapshot {
            shard_id,
            status: e.status,
            session_id: e.session_id.clone(),
            last_sequence: e.last_sequence,
            events_received: e.events_received.load(Ordering::Relaxed),
            reconnects: e.reconnects.load(Ordering::Relaxed),
            exit: e.exit.clone(),
        })
    }

    /// Snapshots of every shard, ordered by shard id
    pub fn snapshots(&self) -> Vec<ShardSnapshot> {
        let mut ids: Vec<u32> = self.inner.shards.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.snapshot(id)).collect()
    }

    /// Get total events received across all shards
    pub fn total_events_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Get count of ready shards
    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.status.is_ready())
            .count()
    }

    /// Get count of shards that reached the terminal status
    pub fn closed_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.status == ShardStatus::Closing)
            .count()
    }

    /// Get tracked shard count
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Check if at least one shard is ready
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }

    /// Check if every shard is ready
    pub fn is_healthy(&self) -> bool {
        self.shard_count() > 0 && self.ready_shards() == self.shard_count()
    }
}
