//! Shard connection module
//!
//! One shard is one gateway connection serving a disjoint slice of events.

pub mod backoff;
mod connection;
pub mod heartbeat;
mod session;
mod state;
pub mod transport;

pub use connection::{ShardConnection, ShardContext};
pub use session::{SessionState, ShardSpec};
pub use state::{ShardSnapshot, ShardState, ShardStateEntry, ShardStatus};
pub use transport::{CloseInfo, Connector, Inbound, Transport, WsConnector};
