//! Event handling module
//!
//! Decoded gateway events, their categories, and the handler registry that
//! delivers them to application code one shard at a time.

pub mod category;
pub mod handler;

pub use category::{DispatchEvent, Event, EventCategory, LifecycleEvent, ShardExit};
pub use handler::{handler_fn, EventHandler, HandlerError, HandlerRegistry};
