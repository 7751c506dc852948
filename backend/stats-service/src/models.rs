//! Domain types shared by ingestion, aggregation and the average queries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A player fouls out on the sixth foul.
pub const MAX_FOULS: u32 = 6;

/// Regulation game length.
pub const MAX_MINUTES_PLAYED: f64 = 48.0;

/// `MAX_MINUTES_PLAYED` expressed in seconds.
pub const MAX_SECONDS_PLAYED: u32 = 2880;

/// One validated game performance of one player.
///
/// This is also the wire format published to Kafka:
/// ```json
/// {
///   "player": "James",
///   "team": "LAL",
///   "season": "2023",
///   "points": 27,
///   "rebounds": 8,
///   "assists": 9,
///   "steals": 1,
///   "blocks": 1,
///   "fouls": 2,
///   "turnovers": 3,
///   "seconds_played": 2105
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatEvent {
    pub player: String,
    pub team: String,
    pub season: String,

    pub points: u32,
    pub rebounds: u32,
    pub assists: u32,
    pub steals: u32,
    pub blocks: u32,
    pub fouls: u32,
    pub turnovers: u32,
    pub seconds_played: u32,
}

impl StatEvent {
    pub fn player_key(&self) -> PlayerKey {
        PlayerKey::new(&self.player, &self.team, &self.season)
    }

    pub fn team_key(&self) -> TeamKey {
        TeamKey::new(&self.team, &self.season)
    }

    /// Kafka message key. Keeps one player's season on one partition.
    pub fn partition_key(&self) -> String {
        self.player_key().to_string()
    }
}

/// Aggregation key of the `player_avg` relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerKey {
    pub player: String,
    pub team: String,
    pub season: String,
}

impl PlayerKey {
    pub fn new(player: &str, team: &str, season: &str) -> Self {
        Self {
            player: player.to_string(),
            team: team.to_string(),
            season: season.to_string(),
        }
    }
}

impl fmt::Display for PlayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.team, self.season, self.player)
    }
}

/// Aggregation key of the `team_avg` relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TeamKey {
    pub team: String,
    pub season: String,
}

impl TeamKey {
    pub fn new(team: &str, season: &str) -> Self {
        Self {
            team: team.to_string(),
            season: season.to_string(),
        }
    }
}

impl fmt::Display for TeamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.team, self.season)
    }
}

/// Accumulated sums of the eight statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatTotals {
    pub points: i64,
    pub rebounds: i64,
    pub assists: i64,
    pub steals: i64,
    pub blocks: i64,
    pub fouls: i64,
    pub turnovers: i64,
    pub seconds_played: i64,
}

impl StatTotals {
    pub fn of(event: &StatEvent) -> Self {
        Self {
            points: i64::from(event.points),
            rebounds: i64::from(event.rebounds),
            assists: i64::from(event.assists),
            steals: i64::from(event.steals),
            blocks: i64::from(event.blocks),
            fouls: i64::from(event.fouls),
            turnovers: i64::from(event.turnovers),
            seconds_played: i64::from(event.seconds_played),
        }
    }

    pub fn add(&mut self, event: &StatEvent) {
        let line = Self::of(event);
        self.points += line.points;
        self.rebounds += line.rebounds;
        self.assists += line.assists;
        self.steals += line.steals;
        self.blocks += line.blocks;
        self.fouls += line.fouls;
        self.turnovers += line.turnovers;
        self.seconds_played += line.seconds_played;
    }
}

/// Running total for one aggregation key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub totals: StatTotals,
    pub game_count: i64,
}

impl AggregateRecord {
    /// Row inserted on the first event for a key.
    pub fn first(event: &StatEvent) -> Self {
        Self {
            totals: StatTotals::of(event),
            game_count: 1,
        }
    }

    /// Additive update applied on every later event for the key.
    pub fn accumulate(&mut self, event: &StatEvent) {
        self.totals.add(event);
        self.game_count += 1;
    }

    /// Per-game means, or `None` when no game was recorded.
    pub fn average(&self) -> Option<AverageRecord> {
        if self.game_count <= 0 {
            return None;
        }

        let games = self.game_count as f64;
        let t = &self.totals;

        Some(AverageRecord {
            points: t.points as f64 / games,
            rebounds: t.rebounds as f64 / games,
            assists: t.assists as f64 / games,
            steals: t.steals as f64 / games,
            blocks: t.blocks as f64 / games,
            fouls: t.fouls as f64 / games,
            turnovers: t.turnovers as f64 / games,
            minutes_played: t.seconds_played as f64 / 60.0 / games,
        })
    }
}

/// Per-game averages returned by the query surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AverageRecord {
    pub points: f64,
    pub rebounds: f64,
    pub assists: f64,
    pub steals: f64,
    pub blocks: f64,
    pub fouls: f64,
    pub turnovers: f64,
    pub minutes_played: f64,
}
