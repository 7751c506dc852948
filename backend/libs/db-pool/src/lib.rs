//! PostgreSQL pool shared by the stats API and the aggregation consumer
//!
//! Both processes read and write the `player_avg` / `team_avg` aggregates
//! through a pool built here. The pool is verified before it is handed out and
//! its connection counts are exported as Prometheus gauges.

mod env_utils;
mod metrics;

pub use env_utils::{parse_env_optional, parse_env_with_default};
pub use metrics::PoolSnapshot;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info};

const METRICS_REFRESH: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct DbConfig {
    /// Label on the pool gauges and log lines
    pub service_name: String,
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Bound on the `SELECT 1` check run after connecting
    pub verify_timeout: Duration,
    /// Wait for a free connection before an acquire fails
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("service_name", &self.service_name)
            .field("database_url", &"[REDACTED]")
            .field("connections", &(self.min_connections..=self.max_connections))
            .field("verify_timeout", &self.verify_timeout)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

impl DbConfig {
    /// Settings for `service_name` with `DB_*` environment overrides.
    ///
    /// The URL comes from the caller, which owns its required settings and
    /// fails startup itself when the URL is missing.
    pub fn for_service(service_name: &str, database_url: impl Into<String>) -> Self {
        let secs =
            |key: &str, default: u64| Duration::from_secs(parse_env_with_default(key, default));

        Self {
            service_name: service_name.to_string(),
            database_url: database_url.into(),
            max_connections: parse_env_with_default("DB_MAX_CONNECTIONS", 10),
            min_connections: parse_env_with_default("DB_MIN_CONNECTIONS", 2),
            verify_timeout: secs("DB_CONNECT_TIMEOUT_SECS", 5),
            acquire_timeout: secs("DB_ACQUIRE_TIMEOUT_SECS", 10),
            idle_timeout: secs("DB_IDLE_TIMEOUT_SECS", 600),
            max_lifetime: secs("DB_MAX_LIFETIME_SECS", 1800),
        }
    }

    pub fn log_config(&self) {
        info!(
            service = %self.service_name,
            max_connections = self.max_connections,
            min_connections = self.min_connections,
            verify_timeout_secs = self.verify_timeout.as_secs(),
            acquire_timeout_secs = self.acquire_timeout.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            max_lifetime_secs = self.max_lifetime.as_secs(),
            "Database pool configuration"
        );
    }
}

/// Connect, verify with `SELECT 1` and start refreshing the pool gauges.
///
/// An unreachable database fails here, at startup, rather than on the first
/// aggregate write.
pub async fn create_pool(config: DbConfig) -> Result<PgPool, sqlx::Error> {
    debug!(service = %config.service_name, "Creating database pool");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .test_before_acquire(true)
        .connect(&config.database_url)
        .await?;

    verify(&pool, &config).await?;
    info!(service = %config.service_name, "Database pool ready");

    metrics::update_pool_metrics(&pool, &config.service_name);
    spawn_metrics_refresh(pool.clone(), config.service_name);

    Ok(pool)
}

async fn verify(pool: &PgPool, config: &DbConfig) -> Result<(), sqlx::Error> {
    let check = sqlx::query("SELECT 1").execute(pool);

    match tokio::time::timeout(config.verify_timeout, check).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            error!(service = %config.service_name, error = %e, "Database check failed");
            Err(e)
        }
        Err(_) => {
            error!(
                service = %config.service_name,
                timeout_secs = config.verify_timeout.as_secs(),
                "Database check timed out"
            );
            Err(sqlx::Error::PoolTimedOut)
        }
    }
}

fn spawn_metrics_refresh(pool: PgPool, service: String) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(METRICS_REFRESH);
        while !pool.is_closed() {
            ticker.tick().await;
            metrics::update_pool_metrics(&pool, &service);
        }
    });
}
