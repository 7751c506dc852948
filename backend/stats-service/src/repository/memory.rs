//! In-memory aggregation store for local runs and tests
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{StatsStore, StoreError};
use crate::models::{AggregateRecord, PlayerKey, StatEvent, TeamKey};

#[derive(Debug, Default)]
pub struct MemoryStatsStore {
    players: Mutex<HashMap<PlayerKey, AggregateRecord>>,
    teams: Mutex<HashMap<TeamKey, AggregateRecord>>,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct player aggregates
    pub fn player_count(&self) -> usize {
        self.players.lock().len()
    }
}

fn upsert<K>(table: &Mutex<HashMap<K, AggregateRecord>>, key: K, event: &StatEvent)
where
    K: std::hash::Hash + Eq,
{
    table
        .lock()
        .entry(key)
        .and_modify(|record| record.accumulate(event))
        .or_insert_with(|| AggregateRecord::first(event));
}

#[async_trait]
impl StatsStore for MemoryStatsStore {
    async fn apply_player(&self, event: &StatEvent) -> Result<(), StoreError> {
        upsert(&self.players, event.player_key(), event);
        Ok(())
    }

    async fn apply_team(&self, event: &StatEvent) -> Result<(), StoreError> {
        upsert(&self.teams, event.team_key(), event);
        Ok(())
    }

    async fn player_aggregate(
        &self,
        key: &PlayerKey,
    ) -> Result<Option<AggregateRecord>, StoreError> {
        Ok(self.players.lock().get(key).copied())
    }

    async fn team_aggregate(&self, key: &TeamKey) -> Result<Option<AggregateRecord>, StoreError> {
        Ok(self.teams.lock().get(key).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(player: &str, points: u32) -> StatEvent {
        StatEvent {
            player: player.to_string(),
            team: "LAL".to_string(),
            season: "2023".to_string(),
            points,
            rebounds: 1,
            assists: 2,
            steals: 0,
            blocks: 0,
            fouls: 1,
            turnovers: 0,
            seconds_played: 600,
        }
    }

    #[tokio::test]
    async fn test_apply_updates_player_and_team() {
        let store = MemoryStatsStore::new();
        store.apply(&event("James", 20)).await.unwrap();
        store.apply(&event("Davis", 30)).await.unwrap();

        let james = store
            .player_aggregate(&PlayerKey::new("James", "LAL", "2023"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(james.game_count, 1);
        assert_eq!(james.totals.points, 20);

        let team = store
            .team_aggregate(&TeamKey::new("LAL", "2023"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(team.game_count, 2);
        assert_eq!(team.totals.points, 50);
        assert_eq!(team.totals.seconds_played, 1200);
    }

    #[tokio::test]
    async fn test_sums_independent_of_order() {
        let events: Vec<StatEvent> = [12, 30, 7, 25, 19].iter().map(|p| event("James", *p)).collect();

        let forward = MemoryStatsStore::new();
        for e in &events {
            forward.apply(e).await.unwrap();
        }
        let backward = MemoryStatsStore::new();
        for e in events.iter().rev() {
            backward.apply(e).await.unwrap();
        }

        let key = PlayerKey::new("James", "LAL", "2023");
        let a = forward.player_aggregate(&key).await.unwrap().unwrap();
        let b = backward.player_aggregate(&key).await.unwrap().unwrap();

        assert_eq!(a, b);
        assert_eq!(a.game_count, 5);
        assert_eq!(a.totals.points, 93);
    }

    #[tokio::test]
    async fn test_unknown_key_is_absent() {
        let store = MemoryStatsStore::new();
        assert!(store
            .team_aggregate(&TeamKey::new("BOS", "2023"))
            .await
            .unwrap()
            .is_none());
    }
}
