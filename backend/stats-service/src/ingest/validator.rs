//! Box-score row validation
//!
//! Turns one raw row (column name → string) into a [`StatEvent`] or a
//! [`RowRejection`]. Column positions are resolved once per upload into a
//! [`ColumnLayout`]; the same rules back the map-based [`validate`] entry point.

use std::collections::HashMap;
use thiserror::Error;

use crate::models::{StatEvent, MAX_FOULS, MAX_MINUTES_PLAYED};

/// Columns every upload must carry, in layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Team,
    Player,
    Season,
    Points,
    Rebounds,
    Assists,
    Steals,
    Blocks,
    Fouls,
    Turnovers,
    MinutesPlayed,
}

impl Column {
    pub const ALL: [Column; 11] = [
        Column::Team,
        Column::Player,
        Column::Season,
        Column::Points,
        Column::Rebounds,
        Column::Assists,
        Column::Steals,
        Column::Blocks,
        Column::Fouls,
        Column::Turnovers,
        Column::MinutesPlayed,
    ];

    /// Header name as it appears in uploaded files
    pub fn name(self) -> &'static str {
        match self {
            Column::Team => "team",
            Column::Player => "player",
            Column::Season => "season",
            Column::Points => "points",
            Column::Rebounds => "rebounds",
            Column::Assists => "assists",
            Column::Steals => "steals",
            Column::Blocks => "blocks",
            Column::Fouls => "fouls",
            Column::Turnovers => "turnovers",
            Column::MinutesPlayed => "minutes played",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowRejection {
    #[error("column '{0}' is missing from the row")]
    MissingField(&'static str),

    #[error("column '{0}' cannot be empty")]
    EmptyField(&'static str),

    #[error("invalid {column} value {value:?}: not a whole number")]
    NotAnInteger { column: &'static str, value: String },

    #[error("invalid {column} value {value}: must not be negative")]
    Negative { column: &'static str, value: i64 },

    #[error("invalid {column} value {value}: too large")]
    TooLarge { column: &'static str, value: i64 },

    #[error("invalid fouls value {0}: must be between 0 and 6")]
    FoulsOutOfRange(i64),

    #[error("invalid minutes played value {0:?}: not a decimal number")]
    InvalidMinutes(String),

    #[error("invalid minutes played value {0}: must be between 0.0 and 48.0")]
    MinutesOutOfRange(f64),

    #[error("row is not valid UTF-8")]
    Encoding,
}

impl RowRejection {
    /// Short label used for the rejection metric
    pub fn reason(&self) -> &'static str {
        match self {
            RowRejection::MissingField(_) => "missing_field",
            RowRejection::EmptyField(_) => "empty_field",
            RowRejection::NotAnInteger { .. } | RowRejection::TooLarge { .. } => "not_a_count",
            RowRejection::Negative { .. } => "negative",
            RowRejection::FoulsOutOfRange(_) => "fouls",
            RowRejection::InvalidMinutes(_) | RowRejection::MinutesOutOfRange(_) => "minutes",
            RowRejection::Encoding => "encoding",
        }
    }
}

/// Header-to-position mapping for one upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    positions: [usize; 11],
}

impl ColumnLayout {
    /// Resolve required columns against a header row.
    ///
    /// Returns the names of every missing column on failure. Extra columns are
    /// ignored; for duplicated headers the last occurrence wins.
    pub fn resolve<'a, I>(headers: I) -> Result<Self, Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let by_name: HashMap<&str, usize> = headers
            .into_iter()
            .enumerate()
            .map(|(pos, name)| (name.trim(), pos))
            .collect();

        let mut positions = [0usize; 11];
        let mut missing = Vec::new();

        for column in Column::ALL {
            match by_name.get(column.name()) {
                Some(pos) => positions[column.index()] = *pos,
                None => missing.push(column.name().to_string()),
            }
        }

        if missing.is_empty() {
            Ok(Self { positions })
        } else {
            Err(missing)
        }
    }

    pub fn position(&self, column: Column) -> usize {
        self.positions[column.index()]
    }

    /// Validate one CSV record laid out according to this header
    pub fn parse(&self, record: &csv::StringRecord) -> Result<StatEvent, RowRejection> {
        build_event(|column| record.get(self.position(column)))
    }
}

/// Validate a row given as column name → raw value
pub fn validate(row: &HashMap<String, String>) -> Result<StatEvent, RowRejection> {
    build_event(|column| row.get(column.name()).map(String::as_str))
}

fn build_event<'a, F>(lookup: F) -> Result<StatEvent, RowRejection>
where
    F: Fn(Column) -> Option<&'a str>,
{
    let field = |column: Column| lookup(column).ok_or(RowRejection::MissingField(column.name()));

    let team = identifier(Column::Team, field(Column::Team)?)?;
    let player = identifier(Column::Player, field(Column::Player)?)?;
    let season = identifier(Column::Season, field(Column::Season)?)?;

    let points = count(Column::Points, field(Column::Points)?)?;
    let rebounds = count(Column::Rebounds, field(Column::Rebounds)?)?;
    let assists = count(Column::Assists, field(Column::Assists)?)?;
    let steals = count(Column::Steals, field(Column::Steals)?)?;
    let blocks = count(Column::Blocks, field(Column::Blocks)?)?;

    let fouls = count(Column::Fouls, field(Column::Fouls)?)?;
    if fouls > MAX_FOULS {
        return Err(RowRejection::FoulsOutOfRange(i64::from(fouls)));
    }

    let turnovers = count(Column::Turnovers, field(Column::Turnovers)?)?;
    let seconds_played = seconds_played(field(Column::MinutesPlayed)?)?;

    Ok(StatEvent {
        player,
        team,
        season,
        points,
        rebounds,
        assists,
        steals,
        blocks,
        fouls,
        turnovers,
        seconds_played,
    })
}

fn identifier(column: Column, raw: &str) -> Result<String, RowRejection> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(RowRejection::EmptyField(column.name()));
    }
    Ok(value.to_string())
}

fn count(column: Column, raw: &str) -> Result<u32, RowRejection> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| RowRejection::NotAnInteger {
            column: column.name(),
            value: raw.to_string(),
        })?;

    if value < 0 {
        return Err(RowRejection::Negative {
            column: column.name(),
            value,
        });
    }

    u32::try_from(value).map_err(|_| RowRejection::TooLarge {
        column: column.name(),
        value,
    })
}

/// Decimal minutes to the stored seconds figure.
///
/// The fractional part is read as tenths of a minute worth one second each
/// (`35.5` → `35 * 60 + 5`). Stored aggregates depend on this exact formula.
///
/// Minutes are parsed at single precision and widened, so `12.9` yields
/// `12 * 60 + 8` and `30.2` yields `30 * 60 + 2`.
fn seconds_played(raw: &str) -> Result<u32, RowRejection> {
    let minutes: f32 = raw
        .trim()
        .parse()
        .map_err(|_| RowRejection::InvalidMinutes(raw.to_string()))?;
    let minutes = f64::from(minutes);

    if !minutes.is_finite() {
        return Err(RowRejection::InvalidMinutes(raw.to_string()));
    }
    if !(0.0..=MAX_MINUTES_PLAYED).contains(&minutes) {
        return Err(RowRejection::MinutesOutOfRange(minutes));
    }

    let whole = minutes.trunc() as u32;
    let tenths = (minutes.fract() * 10.0) as u32;

    Ok(whole * 60 + tenths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MAX_SECONDS_PLAYED;

    fn row(overrides: &[(&str, &str)]) -> HashMap<String, String> {
        let mut row: HashMap<String, String> = [
            ("team", "LAL"),
            ("player", "James"),
            ("season", "2023"),
            ("points", "27"),
            ("rebounds", "8"),
            ("assists", "9"),
            ("steals", "1"),
            ("blocks", "1"),
            ("fouls", "2"),
            ("turnovers", "3"),
            ("minutes played", "35.5"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        for (k, v) in overrides {
            row.insert(k.to_string(), v.to_string());
        }
        row
    }

    #[test]
    fn test_valid_row() {
        let event = validate(&row(&[])).unwrap();

        assert_eq!(event.player, "James");
        assert_eq!(event.team, "LAL");
        assert_eq!(event.season, "2023");
        assert_eq!(event.points, 27);
        assert_eq!(event.turnovers, 3);
        assert_eq!(event.seconds_played, 35 * 60 + 5);
    }

    #[test]
    fn test_fouls_bounds() {
        assert_eq!(validate(&row(&[("fouls", "6")])).unwrap().fouls, 6);
        assert_eq!(
            validate(&row(&[("fouls", "7")])),
            Err(RowRejection::FoulsOutOfRange(7))
        );
        assert!(matches!(
            validate(&row(&[("fouls", "-1")])),
            Err(RowRejection::Negative { column: "fouls", value: -1 })
        ));
    }

    #[test]
    fn test_minutes_bounds() {
        let full = validate(&row(&[("minutes played", "48.0")])).unwrap();
        assert_eq!(full.seconds_played, MAX_SECONDS_PLAYED);

        assert!(matches!(
            validate(&row(&[("minutes played", "48.1")])),
            Err(RowRejection::MinutesOutOfRange(m)) if (m - 48.1).abs() < 1e-4
        ));
        assert_eq!(
            validate(&row(&[("minutes played", "-0.5")])),
            Err(RowRejection::MinutesOutOfRange(-0.5))
        );
        assert!(matches!(
            validate(&row(&[("minutes played", "NaN")])),
            Err(RowRejection::InvalidMinutes(_))
        ));
        assert!(matches!(
            validate(&row(&[("minutes played", "thirty")])),
            Err(RowRejection::InvalidMinutes(_))
        ));
    }

    #[test]
    fn test_seconds_formula_uses_tenths() {
        let cases = [
            ("0", 0),
            ("12", 720),
            ("12.9", 728),
            ("25.3", 1502),
            ("30.2", 1802),
            ("0.5", 5),
            ("47.99", 2829),
        ];
        for (minutes, expected) in cases {
            let event = validate(&row(&[("minutes played", minutes)])).unwrap();
            assert_eq!(event.seconds_played, expected, "minutes played = {minutes}");
        }
    }

    #[test]
    fn test_empty_identifiers_rejected() {
        assert_eq!(
            validate(&row(&[("player", "  ")])),
            Err(RowRejection::EmptyField("player"))
        );
        assert_eq!(
            validate(&row(&[("season", "")])),
            Err(RowRejection::EmptyField("season"))
        );
    }

    #[test]
    fn test_non_numeric_counts_rejected() {
        assert!(matches!(
            validate(&row(&[("points", "twenty")])),
            Err(RowRejection::NotAnInteger { column: "points", .. })
        ));
        assert!(matches!(
            validate(&row(&[("assists", "1.5")])),
            Err(RowRejection::NotAnInteger { column: "assists", .. })
        ));
        assert!(matches!(
            validate(&row(&[("rebounds", "5000000000")])),
            Err(RowRejection::TooLarge { column: "rebounds", .. })
        ));
    }

    #[test]
    fn test_missing_field_in_map() {
        let mut r = row(&[]);
        r.remove("blocks");
        assert_eq!(validate(&r), Err(RowRejection::MissingField("blocks")));
    }

    #[test]
    fn test_layout_reports_all_missing_columns() {
        let missing = ColumnLayout::resolve(["team", "player", "points"]).unwrap_err();

        assert!(missing.contains(&"season".to_string()));
        assert!(missing.contains(&"minutes played".to_string()));
        assert_eq!(missing.len(), 8);
    }

    #[test]
    fn test_layout_parses_reordered_record() {
        let headers = [
            "minutes played",
            "season",
            "team",
            "player",
            "points",
            "rebounds",
            "assists",
            "steals",
            "blocks",
            "fouls",
            "turnovers",
            "notes",
        ];
        let layout = ColumnLayout::resolve(headers).unwrap();
        let record = csv::StringRecord::from(vec![
            "30.2", "2024", "BOS", "Tatum", "31", "9", "4", "1", "0", "3", "2", "ignored",
        ]);

        let event = layout.parse(&record).unwrap();
        assert_eq!(event.team, "BOS");
        assert_eq!(event.player, "Tatum");
        assert_eq!(event.season, "2024");
        assert_eq!(event.points, 31);
        assert_eq!(event.seconds_played, 30 * 60 + 2);
    }

    #[test]
    fn test_short_record_is_rejected() {
        let layout = ColumnLayout::resolve(Column::ALL.iter().map(|c| c.name())).unwrap();
        let record = csv::StringRecord::from(vec!["LAL", "James", "2023"]);

        assert_eq!(
            layout.parse(&record),
            Err(RowRejection::MissingField("points"))
        );
    }
}
