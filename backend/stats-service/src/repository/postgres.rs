//! PostgreSQL aggregation store
//!
//! Each upsert relies on `ON CONFLICT DO UPDATE` row locking for per-key
//! mutual exclusion; there are no application-side locks.

use async_trait::async_trait;
use sqlx::{PgExecutor, PgPool};
use tracing::{debug, warn};

use super::{StatsStore, StoreError};
use crate::models::{AggregateRecord, PlayerKey, StatEvent, StatTotals, TeamKey};

/// How the player and team upserts of one event are issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpsertMode {
    /// Two independent statements. A failure of the team upsert leaves the
    /// player upsert applied.
    #[default]
    Independent,
    /// Both statements in one transaction
    Transactional,
}

const UPSERT_PLAYER: &str = r#"
    INSERT INTO player_avg (
        name, team, season,
        points, rebounds, assists, steals, blocks, fouls, turnovers, seconds_played,
        game_count
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 1)
    ON CONFLICT (name, team, season) DO UPDATE SET
        points = player_avg.points + EXCLUDED.points,
        rebounds = player_avg.rebounds + EXCLUDED.rebounds,
        assists = player_avg.assists + EXCLUDED.assists,
        steals = player_avg.steals + EXCLUDED.steals,
        blocks = player_avg.blocks + EXCLUDED.blocks,
        fouls = player_avg.fouls + EXCLUDED.fouls,
        turnovers = player_avg.turnovers + EXCLUDED.turnovers,
        seconds_played = player_avg.seconds_played + EXCLUDED.seconds_played,
        game_count = player_avg.game_count + 1
"#;

const UPSERT_TEAM: &str = r#"
    INSERT INTO team_avg (
        name, season,
        points, rebounds, assists, steals, blocks, fouls, turnovers, seconds_played,
        game_count
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1)
    ON CONFLICT (name, season) DO UPDATE SET
        points = team_avg.points + EXCLUDED.points,
        rebounds = team_avg.rebounds + EXCLUDED.rebounds,
        assists = team_avg.assists + EXCLUDED.assists,
        steals = team_avg.steals + EXCLUDED.steals,
        blocks = team_avg.blocks + EXCLUDED.blocks,
        fouls = team_avg.fouls + EXCLUDED.fouls,
        turnovers = team_avg.turnovers + EXCLUDED.turnovers,
        seconds_played = team_avg.seconds_played + EXCLUDED.seconds_played,
        game_count = team_avg.game_count + 1
"#;

#[derive(Debug, sqlx::FromRow)]
struct AggregateRow {
    points: i64,
    rebounds: i64,
    assists: i64,
    steals: i64,
    blocks: i64,
    fouls: i64,
    turnovers: i64,
    seconds_played: i64,
    game_count: i64,
}

impl From<AggregateRow> for AggregateRecord {
    fn from(row: AggregateRow) -> Self {
        AggregateRecord {
            totals: StatTotals {
                points: row.points,
                rebounds: row.rebounds,
                assists: row.assists,
                steals: row.steals,
                blocks: row.blocks,
                fouls: row.fouls,
                turnovers: row.turnovers,
                seconds_played: row.seconds_played,
            },
            game_count: row.game_count,
        }
    }
}

pub struct PgStatsRepository {
    pool: PgPool,
    mode: UpsertMode,
}

impl PgStatsRepository {
    pub fn new(pool: PgPool, mode: UpsertMode) -> Self {
        Self { pool, mode }
    }

    async fn apply_independent(&self, event: &StatEvent) -> Result<(), StoreError> {
        self.apply_player(event).await?;

        if let Err(e) = self.apply_team(event).await {
            warn!(
                player = %event.player,
                team = %event.team,
                season = %event.season,
                error = %e,
                "Team aggregate update failed, player aggregate already applied"
            );
            return Err(e.after_player_step());
        }

        Ok(())
    }

    async fn apply_transactional(&self, event: &StatEvent) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        upsert_player(&mut *tx, event).await?;
        upsert_team(&mut *tx, event).await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_player<'e, E>(executor: E, event: &StatEvent) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let line = StatTotals::of(event);

    sqlx::query(UPSERT_PLAYER)
        .bind(&event.player)
        .bind(&event.team)
        .bind(&event.season)
        .bind(line.points)
        .bind(line.rebounds)
        .bind(line.assists)
        .bind(line.steals)
        .bind(line.blocks)
        .bind(line.fouls)
        .bind(line.turnovers)
        .bind(line.seconds_played)
        .execute(executor)
        .await?;

    Ok(())
}

async fn upsert_team<'e, E>(executor: E, event: &StatEvent) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let line = StatTotals::of(event);

    sqlx::query(UPSERT_TEAM)
        .bind(&event.team)
        .bind(&event.season)
        .bind(line.points)
        .bind(line.rebounds)
        .bind(line.assists)
        .bind(line.steals)
        .bind(line.blocks)
        .bind(line.fouls)
        .bind(line.turnovers)
        .bind(line.seconds_played)
        .execute(executor)
        .await?;

    Ok(())
}

#[async_trait]
impl StatsStore for PgStatsRepository {
    async fn apply(&self, event: &StatEvent) -> Result<(), StoreError> {
        match self.mode {
            UpsertMode::Independent => self.apply_independent(event).await?,
            UpsertMode::Transactional => self.apply_transactional(event).await?,
        }

        debug!(
            player = %event.player,
            team = %event.team,
            season = %event.season,
            "Applied stat event to aggregates"
        );
        Ok(())
    }

    async fn apply_player(&self, event: &StatEvent) -> Result<(), StoreError> {
        upsert_player(&self.pool, event).await?;
        Ok(())
    }

    async fn apply_team(&self, event: &StatEvent) -> Result<(), StoreError> {
        upsert_team(&self.pool, event).await?;
        Ok(())
    }

    fn atomic(&self) -> bool {
        self.mode == UpsertMode::Transactional
    }

    async fn player_aggregate(
        &self,
        key: &PlayerKey,
    ) -> Result<Option<AggregateRecord>, StoreError> {
        let row = sqlx::query_as::<_, AggregateRow>(
            r#"
            SELECT points, rebounds, assists, steals, blocks, fouls, turnovers,
                   seconds_played, game_count
            FROM player_avg
            WHERE name = $1 AND team = $2 AND season = $3
            "#,
        )
        .bind(&key.player)
        .bind(&key.team)
        .bind(&key.season)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(AggregateRecord::from))
    }

    async fn team_aggregate(&self, key: &TeamKey) -> Result<Option<AggregateRecord>, StoreError> {
        let row = sqlx::query_as::<_, AggregateRow>(
            r#"
            SELECT points, rebounds, assists, steals, blocks, fouls, turnovers,
                   seconds_played, game_count
            FROM team_avg
            WHERE name = $1 AND season = $2
            "#,
        )
        .bind(&key.team)
        .bind(&key.season)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(AggregateRecord::from))
    }
}
