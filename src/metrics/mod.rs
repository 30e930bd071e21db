//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Snapshot reads
//! - Transaction submission and confirmation
//! - Operation outcomes by error kind
//! - Decoded contract events

use crate::error::{ClientError, ClientResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Read metrics
    pub static ref SNAPSHOT_READS: CounterVec = register_counter_vec!(
        "derivative_client_snapshot_reads_total",
        "Total snapshot reads by outcome",
        &["outcome"]
    ).expect("metric can be registered");

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "derivative_client_chain_block_height",
        "Latest block height seen",
        &["chain_id"]
    ).expect("metric can be registered");

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "derivative_client_transactions_submitted_total",
        "Total transactions submitted",
        &["function"]
    ).expect("metric can be registered");

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "derivative_client_transactions_confirmed_total",
        "Total transactions confirmed by outcome",
        &["stage", "outcome"]
    ).expect("metric can be registered");

    pub static ref CONFIRMATION_TIMEOUTS: CounterVec = register_counter_vec!(
        "derivative_client_confirmation_timeouts_total",
        "Total confirmation waits that exceeded their bound",
        &["stage"]
    ).expect("metric can be registered");

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "derivative_client_confirmation_latency_seconds",
        "Time from submission to confirmation",
        &["stage"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).expect("metric can be registered");

    // Operation metrics
    pub static ref OPERATIONS_FAILED: CounterVec = register_counter_vec!(
        "derivative_client_operations_failed_total",
        "Total failed operations by error kind",
        &["operation", "kind"]
    ).expect("metric can be registered");

    pub static ref EVENTS_DECODED: CounterVec = register_counter_vec!(
        "derivative_client_events_decoded_total",
        "Contract events decoded from confirmed receipts",
        &["event"]
    ).expect("metric can be registered");

    pub static ref DEPOSITS_COMPLETED: CounterVec = register_counter_vec!(
        "derivative_client_deposits_completed_total",
        "Total confirmed collateral deposits",
        &["role"]
    ).expect("metric can be registered");

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "derivative_client_health_check_success_total",
        "Total successful health checks",
        &[]
    ).expect("metric can be registered");

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "derivative_client_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).expect("metric can be registered");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> ClientResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ClientError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| ClientError::Internal(format!("Metrics server failed: {}", e)))
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Encode all registered metrics in the text exposition format
pub fn render() -> ClientResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ClientError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| ClientError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_snapshot_read(ok: bool) {
    SNAPSHOT_READS
        .with_label_values(&[if ok { "ok" } else { "failed" }])
        .inc();
}

pub fn record_block_height(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_tx_submitted(function: &str) {
    TX_SUBMITTED.with_label_values(&[function]).inc();
}

pub fn record_tx_confirmed(stage: &str, success: bool, latency_secs: f64) {
    TX_CONFIRMED
        .with_label_values(&[stage, if success { "success" } else { "reverted" }])
        .inc();
    CONFIRMATION_LATENCY
        .with_label_values(&[stage])
        .observe(latency_secs);
}

pub fn record_confirmation_timeout(stage: &str) {
    CONFIRMATION_TIMEOUTS.with_label_values(&[stage]).inc();
}

pub fn record_operation_failed(operation: &str, error: &ClientError) {
    OPERATIONS_FAILED
        .with_label_values(&[operation, error.kind()])
        .inc();
}

pub fn record_event(event: &str) {
    EVENTS_DECODED.with_label_values(&[event]).inc();
}

pub fn record_deposit_completed(role: &str) {
    DEPOSITS_COMPLETED.with_label_values(&[role]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_metrics() {
        record_tx_submitted("approve");
        record_confirmation_timeout("deposit");
        let text = render().unwrap();
        assert!(text.contains("derivative_client_transactions_submitted_total"));
        assert!(text.contains("derivative_client_confirmation_timeouts_total"));
    }
}
