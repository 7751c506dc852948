use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::{AverageRecord, PlayerKey, TeamKey};
use crate::repository::StatsStore;

/// Per-game averages derived from the stored aggregates
#[derive(Clone)]
pub struct StatsQuery {
    store: Arc<dyn StatsStore>,
}

impl StatsQuery {
    pub fn new(store: Arc<dyn StatsStore>) -> Self {
        Self { store }
    }

    pub async fn player_average(
        &self,
        player: &str,
        team: &str,
        season: &str,
    ) -> Result<AverageRecord> {
        let key = PlayerKey::new(player, team, season);
        self.store
            .player_aggregate(&key)
            .await?
            .and_then(|record| record.average())
            .ok_or_else(|| AppError::NotFound(format!("no games recorded for player {key}")))
    }

    pub async fn team_average(&self, team: &str, season: &str) -> Result<AverageRecord> {
        let key = TeamKey::new(team, season);
        self.store
            .team_aggregate(&key)
            .await?
            .and_then(|record| record.average())
            .ok_or_else(|| AppError::NotFound(format!("no games recorded for team {key}")))
    }
}
