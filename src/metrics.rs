//! Prometheus metrics: a `PrometheusHandle` installed once at startup
//! plus a handler that renders it, with series named for this service's
//! domain (joins, waitlist, outbox).

use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!("join_admitted_total", "Joins admitted as active");
        metrics::describe_counter!("join_waitlisted_total", "Joins placed on the waitlist");
        metrics::describe_counter!("join_rejected_total", "Join attempts rejected (full/closed/banned)");
        metrics::describe_counter!("join_promoted_total", "Waitlisted joins promoted to active");
        metrics::describe_counter!("join_canceled_total", "Joins canceled by their owner");
        metrics::describe_counter!("join_kicked_total", "Joins removed by a moderator");
        metrics::describe_gauge!("outbox_pending", "Outbox rows awaiting publish");
        metrics::describe_gauge!("outbox_dead", "Outbox rows dead-lettered after max attempts");
        metrics::describe_counter!("outbox_published_total", "Outbox rows successfully published");
        metrics::describe_counter!("outbox_publish_failed_total", "Outbox publish attempts that failed");
        metrics::describe_histogram!("outbox_publish_duration_seconds", "Outbox publish-confirm latency");
        metrics::describe_counter!("inbox_duplicate_total", "Inbound deliveries dropped as duplicates");
        metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
        metrics::describe_histogram!("http_request_duration_seconds", "HTTP request duration in seconds");

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}

pub fn record_admitted() {
    metrics::counter!("join_admitted_total", 1);
}

pub fn record_waitlisted() {
    metrics::counter!("join_waitlisted_total", 1);
}

pub fn record_promoted() {
    metrics::counter!("join_promoted_total", 1);
}

pub fn record_canceled() {
    metrics::counter!("join_canceled_total", 1);
}

pub fn record_kicked() {
    metrics::counter!("join_kicked_total", 1);
}

pub fn record_outbox_published() {
    metrics::counter!("outbox_published_total", 1);
}

pub fn record_outbox_publish_failed() {
    metrics::counter!("outbox_publish_failed_total", 1);
}

pub fn record_inbox_duplicate() {
    metrics::counter!("inbox_duplicate_total", 1);
}
