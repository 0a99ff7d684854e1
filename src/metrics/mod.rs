//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain health, scan height and cursor position
//! - Observed events, finality backlog and published tasks
//! - Submissions, requeues and dead letters
//! - Operator alerts

use crate::coordination::Action;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainId, EventType};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "bridge_relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_SCANNED_HEIGHT: GaugeVec = register_gauge_vec!(
        "bridge_relayer_chain_scanned_height",
        "Highest block fetched by the listener per chain",
        &["chain_id"]
    ).unwrap();

    pub static ref CURSOR_HEIGHT: GaugeVec = register_gauge_vec!(
        "bridge_relayer_cursor_height",
        "Persisted listener cursor per chain",
        &["chain_id"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "bridge_relayer_events_observed_total",
        "Total decoded events observed by type",
        &["chain_id", "event_type"]
    ).unwrap();

    pub static ref PENDING_FINALITY: GaugeVec = register_gauge_vec!(
        "bridge_relayer_pending_finality",
        "Events waiting for confirmation depth",
        &["chain_id"]
    ).unwrap();

    pub static ref DECODE_FAILURES: CounterVec = register_counter_vec!(
        "bridge_relayer_decode_failures_total",
        "Total logs skipped because they failed to decode",
        &["chain_id"]
    ).unwrap();

    pub static ref TASKS_PUBLISHED: CounterVec = register_counter_vec!(
        "bridge_relayer_tasks_published_total",
        "Total tasks published to the broker",
        &["chain_id", "event_type"]
    ).unwrap();

    // Dispatcher metrics
    pub static ref TASKS_PROCESSED: CounterVec = register_counter_vec!(
        "bridge_relayer_tasks_processed_total",
        "Total dispatcher task outcomes",
        &["event_type", "outcome"]
    ).unwrap();

    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "bridge_relayer_submissions_total",
        "Total contract submissions by outcome",
        &["chain_id", "action", "outcome"]
    ).unwrap();

    pub static ref SUBMISSION_LATENCY: HistogramVec = register_histogram_vec!(
        "bridge_relayer_submission_latency_seconds",
        "Time from submission to mined receipt",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    pub static ref LOCK_CONTENTION: CounterVec = register_counter_vec!(
        "bridge_relayer_lock_contention_total",
        "Total tasks deferred because another worker held the operation",
        &[]
    ).unwrap();

    pub static ref DEAD_LETTERS: CounterVec = register_counter_vec!(
        "bridge_relayer_dead_letters_total",
        "Total tasks dead-lettered",
        &["event_type"]
    ).unwrap();

    pub static ref ALERTS: CounterVec = register_counter_vec!(
        "bridge_relayer_alerts_total",
        "Total operator alerts raised",
        &["kind"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server: {}", e)))
    }
}

pub async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Raise an operator alert: an `alert = true` error event plus a counter
pub fn raise_alert(kind: &str, message: &str) {
    error!(alert = true, kind, "{}", message);
    ALERTS.with_label_values(&[kind]).inc();
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: ChainId, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_blocks_processed(chain_id: ChainId, block_number: u64) {
    CHAIN_SCANNED_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn set_cursor(chain_id: ChainId, block_number: u64) {
    CURSOR_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_event_observed(chain_id: ChainId, event_type: EventType) {
    EVENTS_OBSERVED
        .with_label_values(&[&chain_id.to_string(), event_type.name()])
        .inc();
}

pub fn set_pending_finality(chain_id: ChainId, pending: usize) {
    PENDING_FINALITY
        .with_label_values(&[&chain_id.to_string()])
        .set(pending as f64);
}

pub fn record_decode_failure(chain_id: ChainId) {
    DECODE_FAILURES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_task_published(chain_id: ChainId, event_type: EventType) {
    TASKS_PUBLISHED
        .with_label_values(&[&chain_id.to_string(), event_type.name()])
        .inc();
}

pub fn record_task_outcome(event_type: EventType, outcome: &str) {
    TASKS_PROCESSED
        .with_label_values(&[event_type.name(), outcome])
        .inc();
}

pub fn record_submission(chain_id: ChainId, action: Action, outcome: &str) {
    SUBMISSIONS
        .with_label_values(&[&chain_id.to_string(), action.function_name(), outcome])
        .inc();
}

pub fn record_submission_latency(chain_id: ChainId, latency_secs: f64) {
    SUBMISSION_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_lock_contention() {
    LOCK_CONTENTION.with_label_values(&[]).inc();
}

pub fn record_dead_letter(event_type: EventType) {
    DEAD_LETTERS
        .with_label_values(&[event_type.name()])
        .inc();
}
