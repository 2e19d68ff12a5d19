//! Prometheus metrics module
//!
//! The library records through `GatewayMetrics` unconditionally. Without an
//! installed recorder the `metrics` macros are no-ops, so embedding
//! applications and tests use `GatewayMetrics::disabled()`.

use crate::error::GatewayError;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Gateway metrics collector
#[derive(Clone, Default)]
pub struct GatewayMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl GatewayMetrics {
    /// Install the global Prometheus recorder and return a renderable handle
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::Metrics(e.to_string()))?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Metrics without an exporter
    pub fn disabled() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions
    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Total dispatch events received from the gateway"
        );
        describe_counter!(
            "gateway_identifies_total",
            Unit::Count,
            "Identify payloads sent"
        );
        describe_counter!(
            "gateway_resumes_total",
            Unit::Count,
            "Resume payloads sent"
        );
        describe_counter!(
            "gateway_reconnects_total",
            Unit::Count,
            "Shard reconnects, labelled by whether the session was kept"
        );
        describe_counter!(
            "gateway_errors_total",
            Unit::Count,
            "Total gateway errors"
        );
        describe_counter!(
            "gateway_handler_failures_total",
            Unit::Count,
            "Event handler errors and panics"
        );

        describe_histogram!(
            "gateway_heartbeat_latency_seconds",
            Unit::Seconds,
            "Heartbeat round trip"
        );

        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards in ready state"
        );
        describe_gauge!(
            "gateway_last_heartbeat_timestamp",
            Unit::Seconds,
            "Unix time of the last heartbeat ack"
        );
    }

    /// Record a dispatch event received
    pub fn record_event(&self, shard_id: u32, event_type: &str) {
        counter!(
            "gateway_events_received_total",
            "shard_id" => shard_id.to_string(),
            "event_type" => event_type.to_ascii_lowercase()
        )
        .increment(1);
    }

    /// Record an identify sent
    pub fn record_identify(&self, shard_id: u32) {
        counter!(
            "gateway_identifies_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record a resume sent
    pub fn record_resume(&self, shard_id: u32) {
        counter!(
            "gateway_resumes_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record a reconnect
    pub fn record_reconnect(&self, shard_id: u32, resumable: bool) {
        counter!(
            "gateway_reconnects_total",
            "shard_id" => shard_id.to_string(),
            "resumable" => if resumable { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Record gateway error
    pub fn record_error(&self, shard_id: u32, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    /// Record a handler error or panic
    pub fn record_handler_failure(&self, category: &'static str, kind: &'static str) {
        counter!(
            "gateway_handler_failures_total",
            "category" => category,
            "kind" => kind
        )
        .increment(1);
    }

    /// Record heartbeat ack
    pub fn record_heartbeat(&self, shard_id: u32, latency: Option<Duration>) {
        gauge!(
            "gateway_last_heartbeat_timestamp",
            "shard_id" => shard_id.to_string()
        )
        .set(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
        );

        if let Some(latency) = latency {
            histogram!(
                "gateway_heartbeat_latency_seconds",
                "shard_id" => shard_id.to_string()
            )
            .record(latency.as_secs_f64());
        }
    }

    /// Set shards ready count
    pub fn set_shards_ready(&self, count: usize) {
        gauge!("gateway_shards_ready").set(count as f64);
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.handle.is_some()
    }
}
