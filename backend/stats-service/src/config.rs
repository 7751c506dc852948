//! Configuration for the stats API and the aggregation consumer
//!
//! Loaded from `STATS_`-prefixed environment variables. `STATS_KAFKA_BROKERS`
//! and `STATS_DATABASE_URL` are required; everything else has a default.
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::kafka::runner::RunnerSettings;
use crate::repository::postgres::UpsertMode;

const ENV_PREFIX: &str = "STATS_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct, loaded from environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Comma separated Kafka bootstrap servers
    pub kafka_brokers: String,

    /// PostgreSQL connection URL
    pub database_url: String,

    /// Topic carrying serialized stat events
    #[serde(default = "default_kafka_topic")]
    pub kafka_topic: String,

    /// Consumer group shared by all aggregation consumers
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default = "default_producer_client_id")]
    pub producer_client_id: String,

    #[serde(default = "default_consumer_client_id")]
    pub consumer_client_id: String,

    /// Maximum handled messages per second, per consumer process
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,

    /// Upper bound on waiting for in-flight partitions at shutdown
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Pause after a failed join or a broken session
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Delay before redelivering a message whose handler failed
    #[serde(default = "default_handler_retry_backoff_ms")]
    pub handler_retry_backoff_ms: u64,

    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,

    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,

    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Per-partition delivery buffer between the Kafka pump and a claim
    #[serde(default = "default_partition_buffer")]
    pub partition_buffer: usize,

    /// Wrap the player and team upserts in one transaction
    #[serde(default)]
    pub atomic_upserts: bool,

    #[serde(default = "default_assignment_poll_ms")]
    pub assignment_poll_ms: u64,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

fn default_kafka_topic() -> String {
    "nba-stats".to_string()
}

fn default_consumer_group() -> String {
    "stats-consumer-group".to_string()
}

fn default_producer_client_id() -> String {
    "api".to_string()
}

fn default_consumer_client_id() -> String {
    "consumer-app".to_string()
}

fn default_rate_limit() -> u32 {
    100
}

fn default_handler_timeout_secs() -> u64 {
    60
}

fn default_drain_timeout_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_handler_retry_backoff_ms() -> u64 {
    1000
}

fn default_publish_timeout_secs() -> u64 {
    30
}

fn default_publish_retries() -> u32 {
    10
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_partition_buffer() -> usize {
    256
}

fn default_assignment_poll_ms() -> u64 {
    500
}

fn default_session_timeout_ms() -> u64 {
    10_000
}

impl Config {
    /// Load configuration from `STATS_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Config = envy::prefixed(ENV_PREFIX).from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka_brokers.split(',').all(|b| b.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "STATS_KAFKA_BROKERS must list at least one broker".into(),
            ));
        }
        if self.kafka_topic.trim().is_empty() {
            return Err(ConfigError::Invalid("STATS_KAFKA_TOPIC is empty".into()));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(ConfigError::Invalid("STATS_CONSUMER_GROUP is empty".into()));
        }
        if self.rate_limit_per_sec == 0 {
            return Err(ConfigError::Invalid(
                "STATS_RATE_LIMIT_PER_SEC must be greater than zero".into(),
            ));
        }
        if self.handler_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "STATS_HANDLER_TIMEOUT_SECS must be greater than zero".into(),
            ));
        }
        if self.partition_buffer == 0 {
            return Err(ConfigError::Invalid(
                "STATS_PARTITION_BUFFER must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn assignment_poll_interval(&self) -> Duration {
        Duration::from_millis(self.assignment_poll_ms)
    }

    pub fn upsert_mode(&self) -> UpsertMode {
        if self.atomic_upserts {
            UpsertMode::Transactional
        } else {
            UpsertMode::Independent
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            handler_timeout: Duration::from_secs(self.handler_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
            retry_backoff: Duration::from_millis(self.handler_retry_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "STATS_KAFKA_BROKERS",
        "STATS_DATABASE_URL",
        "STATS_KAFKA_TOPIC",
        "STATS_RATE_LIMIT_PER_SEC",
        "STATS_ATOMIC_UPSERTS",
        "STATS_HANDLER_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_applied() {
        clear_env();
        std::env::set_var("STATS_KAFKA_BROKERS", "kafka:9092");
        std::env::set_var("STATS_DATABASE_URL", "postgres://localhost/stats");

        let config = Config::from_env().unwrap();
        assert_eq!(config.kafka_topic, "nba-stats");
        assert_eq!(config.consumer_group, "stats-consumer-group");
        assert_eq!(config.producer_client_id, "api");
        assert_eq!(config.consumer_client_id, "consumer-app");
        assert_eq!(config.rate_limit_per_sec, 100);
        assert_eq!(config.publish_retries, 10);
        assert_eq!(config.upsert_mode(), UpsertMode::Independent);

        let settings = config.runner_settings();
        assert_eq!(settings.handler_timeout, Duration::from_secs(60));
        assert_eq!(settings.drain_timeout, Duration::from_secs(60));
        assert_eq!(settings.cooldown, Duration::from_secs(60));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_brokers_is_fatal() {
        clear_env();
        std::env::set_var("STATS_DATABASE_URL", "postgres://localhost/stats");

        assert!(matches!(Config::from_env(), Err(ConfigError::Env(_))));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_zero_rate_limit_rejected() {
        clear_env();
        std::env::set_var("STATS_KAFKA_BROKERS", "kafka:9092");
        std::env::set_var("STATS_DATABASE_URL", "postgres://localhost/stats");
        std::env::set_var("STATS_RATE_LIMIT_PER_SEC", "0");

        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid(_))));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_zero_handler_timeout_rejected() {
        clear_env();
        std::env::set_var("STATS_KAFKA_BROKERS", "kafka:9092");
        std::env::set_var("STATS_DATABASE_URL", "postgres://localhost/stats");
        std::env::set_var("STATS_HANDLER_TIMEOUT_SECS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("HANDLER_TIMEOUT")));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_atomic_upserts_switch() {
        clear_env();
        std::env::set_var("STATS_KAFKA_BROKERS", "kafka:9092");
        std::env::set_var("STATS_DATABASE_URL", "postgres://localhost/stats");
        std::env::set_var("STATS_ATOMIC_UPSERTS", "true");

        let config = Config::from_env().unwrap();
        assert_eq!(config.upsert_mode(), UpsertMode::Transactional);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_blank_broker_list_rejected() {
        clear_env();
        std::env::set_var("STATS_KAFKA_BROKERS", " , ");
        std::env::set_var("STATS_DATABASE_URL", "postgres://localhost/stats");

        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid(_))));

        clear_env();
    }
}
