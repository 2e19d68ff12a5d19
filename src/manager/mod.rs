//! Session management
//!
//! `SessionManager` is the capability the application programs against:
//! start shards, register handlers, stop. `LocalSessionManager` runs every
//! assigned shard in this process.

mod assign;
mod local;

pub use assign::{AllShards, PoolAssigner, ShardAssigner};
pub use local::LocalSessionManager;

use crate::error::GatewayError;
use crate::events::{EventCategory, EventHandler};
use crate::intents::Intents;
use crate::token::TokenSource;
use async_trait::async_trait;
use std::sync::Arc;

/// Application overrides for a start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApInfo {
    /// Shard count; takes precedence over the recommended count
    pub shards: Option<u32>,
    /// Gateway endpoint; takes precedence over the resolved url
    pub url: Option<String>,
}

impl ApInfo {
    pub fn with_shards(shards: u32) -> Self {
        Self {
            shards: Some(shards),
            url: None,
        }
    }
}

/// Start/stop/handler surface shared by every manager implementation
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Resolve gateway info and start all assigned shards.
    ///
    /// Returns once the shards are spawned; failures after that point are
    /// reported through lifecycle events and shard status.
    async fn start(
        &self,
        ap_info: ApInfo,
        token: Arc<dyn TokenSource>,
        intents: Intents,
    ) -> Result<(), GatewayError>;

    /// Handlers of one category run in registration order
    fn register_handler(&self, category: EventCategory, handler: Arc<dyn EventHandler>);

    /// Close every shard and wait for them, bounded by the shutdown timeout
    async fn stop(&self) -> Result<(), GatewayError>;
}
