//! Handler registry and per-shard dispatch
//!
//! Each shard owns one dispatch task draining its event channel, so events
//! of a shard reach handlers in receipt order while shards run in parallel.
//! A failing or panicking handler only loses its own call.

use crate::events::category::{Event, EventCategory};
use crate::metrics::GatewayMetrics;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Error returned by application handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application callback for gateway events
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Adapter for synchronous closures
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.0)(event)
    }
}

/// Wrap a closure as a handler
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers by category, each list in registration order
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<EventCategory, Vec<Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, category: EventCategory, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(category).or_default().push(handler);
    }

    /// Category handlers first, then wildcard handlers
    pub fn handlers_for(&self, category: EventCategory) -> Vec<Arc<dyn EventHandler>> {
        let mut selected = self
            .handlers
            .get(&category)
            .map(|list| list.value().clone())
            .unwrap_or_default();
        if category != EventCategory::All {
            if let Some(all) = self.handlers.get(&EventCategory::All) {
                selected.extend(all.iter().cloned());
            }
        }
        selected
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.iter().map(|list| list.len()).sum()
    }

    /// Run every matching handler for one event, isolating failures
    pub async fn dispatch(&self, event: &Event, metrics: &GatewayMetrics) {
        let category = event.category();
        for handler in self.handlers_for(category) {
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metrics.record_handler_failure(category.as_str(), "error");
                    warn!(
                        shard_id = event.shard_id(),
                        category = category.as_str(),
                        error = %e,
                        "Event handler returned an error"
                    );
                }
                Err(panic) => {
                    metrics.record_handler_failure(category.as_str(), "panic");
                    error!(
                        shard_id = event.shard_id(),
                        category = category.as_str(),
                        panic = panic_message(&panic),
                        "Event handler panicked"
                    );
                }
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Drain one shard's event channel until its connection drops the sender
pub async fn run_dispatch(
    shard_id: u32,
    mut events: mpsc::UnboundedReceiver<Event>,
    registry: HandlerRegistry,
    metrics: GatewayMetrics,
) {
    while let Some(event) = events.recv().await {
        registry.dispatch(&event, &metrics).await;
    }
    debug!(shard_id, "Shard dispatch drained");
}
