// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus recorder setup and typed helpers. The exporter is pull-based:
// the /metrics endpoint renders whatever has been recorded since startup.
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// METRIC NAMES
// -----------------------------------------------------------------------------

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Reservation lifecycle events. Labels: event (create/confirm/ready/
/// collected/cancel), outcome (success/failed)
pub const RESERVATIONS_TOTAL: &str = "reservations_total";

/// Reservations moved to expired by the sweep or the lazy read path.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "reservations_expired_total";

/// Medicine search requests. Labels: matched (true/false)
pub const MEDICINE_SEARCHES_TOTAL: &str = "medicine_searches_total";

/// Current stock quantity after a ledger mutation.
/// Labels: pharmacy, medicine
pub const STOCK_LEVEL: &str = "stock_level";

/// Labels: operation (select/insert/update/transaction)
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Labels: operation (get/set/delete)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// -----------------------------------------------------------------------------
// SETUP
// -----------------------------------------------------------------------------

/// Install the global Prometheus recorder and return the render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(RESERVATIONS_TOTAL, "Reservation lifecycle events by outcome");
    describe_counter!(
        RESERVATIONS_EXPIRED_TOTAL,
        "Reservations transitioned to expired with stock restored"
    );
    describe_counter!(MEDICINE_SEARCHES_TOTAL, "Medicine search requests");
    describe_gauge!(STOCK_LEVEL, "Stock quantity after the latest ledger mutation");
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database query latency in seconds");
    describe_histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "Redis operation latency in seconds"
    );

    Ok(handle)
}

// -----------------------------------------------------------------------------
// HELPERS
// -----------------------------------------------------------------------------

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

/// Record a reservation lifecycle event and whether it was accepted.
pub fn record_reservation_event(event: &str, success: bool) {
    let outcome = if success { "success" } else { "failed" };
    counter!(
        RESERVATIONS_TOTAL,
        "event" => event.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_expired(count: u64) {
    counter!(RESERVATIONS_EXPIRED_TOTAL).increment(count);
}

pub fn record_search(matched: bool) {
    counter!(
        MEDICINE_SEARCHES_TOTAL,
        "matched" => matched.to_string()
    )
    .increment(1);
}

pub fn set_stock_level(pharmacy_id: Uuid, medicine_id: Uuid, quantity: i32) {
    gauge!(
        STOCK_LEVEL,
        "pharmacy" => pharmacy_id.to_string(),
        "medicine" => medicine_id.to_string()
    )
    .set(quantity as f64);
}

pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

pub fn record_redis_operation(operation: &str, duration_secs: f64) {
    histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}
