//! Stats Service Library
//!
//! Box-score ingestion, a Kafka-backed aggregation consumer and per-game
//! average queries over PostgreSQL.
//!
//! # Modules
//!
//! - `ingest`: CSV upload validation and publishing
//! - `kafka`: producer, consumer group client and the partition runner
//! - `repository`: aggregate storage (PostgreSQL and in-memory)
//! - `services`: average queries
//! - `http`: actix-web routes

pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod ingest;
pub mod kafka;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod repository;
pub mod services;

pub use config::Config;
pub use error::{AppError, Result};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`; `STATS_LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,actix_web=info,stats_service=debug".into());

    let json = std::env::var("STATS_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
