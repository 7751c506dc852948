//! Stat event producer
//!
//! Publishes validated box-score rows to the stats topic and waits for the
//! acknowledgement of every in-sync replica before returning.

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::models::StatEvent;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("Broker unreachable: {0}")]
    Unreachable(String),
}

/// Where an acknowledged event landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// Durable append of one event to the stats topic.
///
/// Returns only after the log acknowledged the write, or with the error that
/// remained once the implementation's own retries were exhausted.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &StatEvent) -> Result<PublishReceipt, PublishError>;
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub brokers: String,
    pub topic: String,
    pub client_id: String,
    pub retries: u32,
    pub delivery_timeout: Duration,
}

impl From<&Config> for PublisherSettings {
    fn from(config: &Config) -> Self {
        Self {
            brokers: config.kafka_brokers.clone(),
            topic: config.kafka_topic.clone(),
            client_id: config.producer_client_id.clone(),
            retries: config.publish_retries,
            delivery_timeout: config.publish_timeout(),
        }
    }
}

/// Kafka-backed [`EventPublisher`]
pub struct KafkaStatPublisher {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaStatPublisher {
    /// Create the producer and make sure the cluster answers.
    ///
    /// Fails when the brokers cannot be reached within the delivery timeout,
    /// which callers treat as fatal at startup.
    pub async fn connect(settings: PublisherSettings) -> Result<Self, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("client.id", &settings.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "5")
            .set("message.send.max.retries", settings.retries.to_string())
            .set(
                "message.timeout.ms",
                settings.delivery_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| PublishError::Kafka(e.to_string()))?;

        let metadata_client = producer.clone();
        let topic = settings.topic.clone();
        let timeout = settings.delivery_timeout;
        tokio::task::spawn_blocking(move || {
            metadata_client
                .client()
                .fetch_metadata(Some(&topic), timeout)
                .map(|_| ())
        })
        .await
        .map_err(|e| PublishError::Unreachable(e.to_string()))?
        .map_err(|e| PublishError::Unreachable(e.to_string()))?;

        info!(
            brokers = %settings.brokers,
            topic = %settings.topic,
            client_id = %settings.client_id,
            "Stats Kafka producer initialized"
        );

        Ok(Self {
            producer,
            topic: settings.topic,
            delivery_timeout: settings.delivery_timeout,
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaStatPublisher {
    async fn publish(&self, event: &StatEvent) -> Result<PublishReceipt, PublishError> {
        let payload =
            serde_json::to_string(event).map_err(|e| PublishError::Serialization(e.to_string()))?;
        let key = event.partition_key();

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        match self.producer.send(record, self.delivery_timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    player = %event.player,
                    team = %event.team,
                    season = %event.season,
                    partition = partition,
                    offset = offset,
                    "Published stat event"
                );
                Ok(PublishReceipt { partition, offset })
            }
            Err((err, _)) => {
                error!(
                    player = %event.player,
                    team = %event.team,
                    season = %event.season,
                    error = %err,
                    "Failed to publish stat event"
                );
                Err(PublishError::Kafka(err.to_string()))
            }
        }
    }
}
