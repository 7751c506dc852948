//! Consumer-group seams
//!
//! A [`GroupClient`] hands out one [`GroupSession`] per group generation. The
//! session owns one bounded channel per claimed partition and a cancellation
//! token; the client cancels the token and resolves `closed` when the
//! generation ends. The runner drives claims and commits through these types
//! only, so the Kafka client and the in-process log are interchangeable.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Error)]
pub enum CoordinationError {
    #[error("Failed to join consumer group: {0}")]
    Join(String),

    #[error("Consumer error: {0}")]
    Consume(String),

    #[error("Failed to commit offset: {0}")]
    Commit(String),

    #[error("Consumer group client is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Payload could not be decoded. Retrying cannot succeed.
    #[error("Malformed payload: {0}")]
    Decode(String),

    #[error("Aggregation store error: {0}")]
    Store(String),

    #[error("Handler timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl HandlerError {
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Decode(_) => "decode",
            HandlerError::Store(_) => "store",
            HandlerError::Timeout(_) => "timeout",
        }
    }
}

/// One message read from a claimed partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// A partition owned by this member for the lifetime of one session
#[derive(Debug)]
pub struct PartitionClaim {
    pub topic: String,
    pub partition: i32,
    pub messages: mpsc::Receiver<Delivery>,
}

/// Why a session ended
#[derive(Debug, Clone)]
pub enum SessionClosed {
    /// The group reassigned partitions; join again.
    Rebalance,
    /// The connection broke; cool down before joining again.
    Error(CoordinationError),
}

/// Partitions claimed by this member in one group generation
#[derive(Debug)]
pub struct GroupSession {
    pub generation: u64,
    pub claims: Vec<PartitionClaim>,
    /// Cancelled by the client when the generation ends
    pub token: CancellationToken,
    pub closed: oneshot::Receiver<SessionClosed>,
}

impl GroupSession {
    pub fn partitions(&self) -> Vec<(String, i32)> {
        self.claims
            .iter()
            .map(|c| (c.topic.clone(), c.partition))
            .collect()
    }
}

#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Wait for the next group generation and return its session
    async fn join(&self) -> Result<GroupSession, CoordinationError>;

    /// Mark `delivery` as processed; its partition resumes after it on the
    /// next assignment
    fn commit(&self, delivery: &Delivery) -> Result<(), CoordinationError>;

    /// Leave the group and release the connection
    async fn close(&self);
}

/// Processes one delivery. An error leaves the offset uncommitted.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}
