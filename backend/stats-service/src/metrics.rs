//! Prometheus metrics for ingestion and aggregation
//!
//! All collectors live in the default registry so `/metrics` also exposes the
//! `db_pool_connections` gauges registered by `db-pool`.

use actix_web::{HttpResponse, Responder};
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

lazy_static::lazy_static! {
    /// CSV rows rejected by the validator, by rejection kind
    pub static ref ROWS_REJECTED: IntCounterVec = register_int_counter_vec!(
        "stats_rows_rejected_total",
        "Upload rows rejected during validation",
        &["reason"]
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref EVENTS_PUBLISHED: IntCounter = register_int_counter!(
        "stats_events_published_total",
        "Stat events acknowledged by all in-sync replicas"
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref PUBLISH_FAILURES: IntCounter = register_int_counter!(
        "stats_publish_failures_total",
        "Stat events skipped after the producer gave up"
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref MESSAGES_PROCESSED: IntCounter = register_int_counter!(
        "stats_messages_processed_total",
        "Messages aggregated and committed"
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Handler failures, by kind (decode, store, timeout)
    pub static ref MESSAGES_FAILED: IntCounterVec = register_int_counter_vec!(
        "stats_messages_failed_total",
        "Messages left uncommitted after a handler failure",
        &["kind"]
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref REBALANCES: IntCounter = register_int_counter!(
        "stats_consumer_rebalances_total",
        "Consumer group sessions ended by a rebalance"
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref COOLDOWNS: IntCounter = register_int_counter!(
        "stats_consumer_cooldowns_total",
        "Cooldown pauses after a coordination error"
    ).expect("Prometheus metrics registration should succeed at startup");
}

/// Serialise the default registry in the Prometheus text format
pub fn render() -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

/// `GET /metrics`
pub async fn metrics_handler() -> impl Responder {
    match render() {
        Ok((content_type, body)) => HttpResponse::Ok().content_type(content_type).body(body),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}
