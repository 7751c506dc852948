//! Aggregation store
//!
//! The store is the only writer of `player_avg` and `team_avg`. Updates are
//! additive and not deduplicated: applying the same event twice counts it
//! twice.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{AggregateRecord, PlayerKey, StatEvent, TeamKey};

pub use memory::MemoryStatsStore;
pub use postgres::{PgStatsRepository, UpsertMode};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The player row was updated but the team row was not
    #[error("Team aggregate update failed after player aggregate was applied: {0}")]
    PartialUpdate(#[source] Box<StoreError>),
}

impl StoreError {
    /// Mark a team-step failure that follows an applied player step
    pub fn after_player_step(self) -> Self {
        match self {
            partial @ StoreError::PartialUpdate(_) => partial,
            other => StoreError::PartialUpdate(Box::new(other)),
        }
    }
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Add `event` to its player aggregate, then to its team aggregate.
    ///
    /// Unless [`StatsStore::atomic`] holds, a failed team step leaves the
    /// player step applied and is reported as [`StoreError::PartialUpdate`].
    async fn apply(&self, event: &StatEvent) -> Result<(), StoreError> {
        self.apply_player(event).await?;
        self.apply_team(event)
            .await
            .map_err(StoreError::after_player_step)
    }

    async fn apply_player(&self, event: &StatEvent) -> Result<(), StoreError>;

    async fn apply_team(&self, event: &StatEvent) -> Result<(), StoreError>;

    /// Whether `apply` updates both aggregates or neither
    fn atomic(&self) -> bool {
        false
    }

    async fn player_aggregate(&self, key: &PlayerKey)
        -> Result<Option<AggregateRecord>, StoreError>;

    async fn team_aggregate(&self, key: &TeamKey) -> Result<Option<AggregateRecord>, StoreError>;
}
