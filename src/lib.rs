//! Chat Gateway - sharded gateway client for a chat-bot platform
//!
//! - Resolves gateway parameters once per start over REST
//! - Runs one state machine per shard (identify, heartbeat, resume)
//! - Throttles identifies through one shared limiter
//! - Delivers events to registered handlers in per-shard order

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod intents;
pub mod limiter;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod rest;
pub mod shard;
pub mod token;

pub use config::{GatewayConfig, SessionPolicy};
pub use error::GatewayError;
pub use events::{
    handler_fn, DispatchEvent, Event, EventCategory, EventHandler, HandlerError, LifecycleEvent,
    ShardExit,
};
pub use intents::Intents;
pub use manager::{AllShards, ApInfo, LocalSessionManager, PoolAssigner, SessionManager, ShardAssigner};
pub use token::{AppAccessTokenSource, Token, TokenSource, TokenType};
