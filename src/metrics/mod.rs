//! Prometheus metrics module

use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Arc, OnceLock};

/// The recorder is process-wide; every bot in one process shares it.
static RECORDER: OnceLock<Arc<PrometheusHandle>> = OnceLock::new();

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    handle: Arc<PrometheusHandle>,
}

impl GatewayMetrics {
    /// Initialize metrics and return handle
    pub fn new() -> Self {
        let handle = RECORDER
            .get_or_init(|| {
                let handle = PrometheusBuilder::new()
                    .install_recorder()
                    .expect("Failed to install Prometheus recorder");
                Self::register_metrics();
                Arc::new(handle)
            })
            .clone();

        Self { handle }
    }

    /// Register metric descriptions
    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Total payloads received from the gateway"
        );
        describe_counter!(
            "gateway_events_dispatched_total",
            Unit::Count,
            "Total dispatches forwarded to the output channel"
        );
        describe_counter!(
            "gateway_heartbeats_sent_total",
            Unit::Count,
            "Heartbeats sent to the gateway"
        );
        describe_counter!(
            "gateway_reconnects_total",
            Unit::Count,
            "Reconnects by reason"
        );
        describe_counter!(
            "gateway_zombie_connections_total",
            Unit::Count,
            "Connections reset for missing a heartbeat ACK"
        );
        describe_counter!(
            "gateway_errors_total",
            Unit::Count,
            "Total gateway errors"
        );

        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards in ready state"
        );
        describe_gauge!(
            "gateway_last_heartbeat_timestamp",
            Unit::Seconds,
            "Unix timestamp of the last heartbeat per shard"
        );
    }

    /// Record an inbound gateway event
    pub fn record_event(&self, shard_id: u64) {
        counter!(
            "gateway_events_received_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record a dispatch forwarded to the output channel
    pub fn record_dispatch(&self, shard_id: u64, event_type: &str) {
        counter!(
            "gateway_events_dispatched_total",
            "shard_id" => shard_id.to_string(),
            "event_type" => event_type.to_string()
        )
        .increment(1);
    }

    /// Record a heartbeat sent
    pub fn record_heartbeat(&self, shard_id: u64) {
        counter!(
            "gateway_heartbeats_sent_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);

        gauge!(
            "gateway_last_heartbeat_timestamp",
            "shard_id" => shard_id.to_string()
        )
        .set(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs() as f64,
        );
    }

    /// Record a reconnect with its reason (close code, zombie, op 7, ...)
    pub fn record_reconnect(&self, shard_id: u64, reason: &str) {
        counter!(
            "gateway_reconnects_total",
            "shard_id" => shard_id.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    /// Record a zombie connection reset
    pub fn record_zombie(&self, shard_id: u64) {
        counter!(
            "gateway_zombie_connections_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record gateway error
    pub fn record_error(&self, shard_id: u64, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    /// Set shards ready count
    pub fn set_shards_ready(&self, count: usize) {
        gauge!("gateway_shards_ready").set(count as f64);
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
