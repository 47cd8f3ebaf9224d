use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Attempt lifecycle metrics
    pub static ref ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempts_total",
        "Total number of attempt starts",
        &["action"]
    )
    .unwrap();

    pub static ref ATTEMPTS_ACTIVE: IntGauge = register_int_gauge!(
        "attempts_active",
        "Number of currently in_progress attempts"
    )
    .unwrap();

    pub static ref ATTEMPTS_FINALIZED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempts_finalized_total",
        "Total number of attempts finalized",
        &["trigger"]
    )
    .unwrap();

    pub static ref ATTEMPTS_INVALIDATED_TOTAL: IntCounter = register_int_counter!(
        "attempts_invalidated_total",
        "Total number of attempts invalidated"
    )
    .unwrap();

    pub static ref ANSWER_SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "answer_submissions_total",
        "Total number of answer submissions",
        &["outcome"]
    )
    .unwrap();

    // Outbox metrics
    pub static ref OUTBOX_ENQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "outbox_enqueued_total",
        "Total number of outbox enqueue calls",
        &["event_type", "outcome"]
    )
    .unwrap();

    pub static ref OUTBOX_PUBLISHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "outbox_publishes_total",
        "Total number of outbox publish outcomes",
        &["outcome"]
    )
    .unwrap();

    pub static ref OUTBOX_LEASES_RECLAIMED_TOTAL: IntCounter = register_int_counter!(
        "outbox_leases_reclaimed_total",
        "Total number of stale publishing leases reclaimed"
    )
    .unwrap();

    // Worker tick metrics
    pub static ref EXPIRY_WORKER_TICKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "expiry_worker_ticks_total",
        "Total number of expiry worker ticks",
        &["status"]
    )
    .unwrap();

    pub static ref OUTBOX_PUBLISHER_TICKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "outbox_publisher_ticks_total",
        "Total number of outbox publisher ticks",
        &["status"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}
