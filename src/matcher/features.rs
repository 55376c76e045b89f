// =============================================================================
// Feature extraction from normalized market titles
// =============================================================================
//
// Given a normalized title (see normalize.rs), pull out the structured pieces
// the grouping rules key on: a team pair, a date, a numeric threshold with
// unit handling, a metric category, and a directional modifier.
//
// All parsing is deterministic and anchored to a caller-supplied reference
// date so the matcher stays a pure function.
// =============================================================================

use chrono::{Datelike, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref MATCHUP_RE: Regex =
        Regex::new(r"^(.{2,60}?)\s+(?:vs|@|at)\s+(.{2,60}?)(?:\s+on\b.*)?$").unwrap();
    static ref ISO_DATE_RE: Regex = Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap();
    static ref SLASH_DATE_RE: Regex = Regex::new(r"\b(\d{1,2})/(\d{1,2})\b").unwrap();
    static ref MONTH_DAY_RE: Regex = Regex::new(
        r"\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+(\d{1,2})\b"
    )
    .unwrap();
    static ref THRESHOLD_RE: Regex =
        Regex::new(r"\$?(\d+(?:\.\d+)?)\s*([kmb])?\s*(%|°f|°c|°)?").unwrap();
}

/// Directional modifier attached to a threshold or a matchup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Above,
    Below,
    Wins,
    Loses,
}

impl Direction {
    /// Opposing directions belong to the same family so that "above 70" and
    /// "below 70" markets still group together.
    pub fn family(&self) -> &'static str {
        match self {
            Self::Above | Self::Below => "threshold",
            Self::Wins | Self::Loses => "result",
        }
    }

    pub fn is_opposing(&self, other: Direction) -> bool {
        matches!(
            (self, other),
            (Self::Above, Self::Below)
                | (Self::Below, Self::Above)
                | (Self::Wins, Self::Loses)
                | (Self::Loses, Self::Wins)
        )
    }
}

/// Broad metric category for prediction markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricCategory {
    Price,
    Temperature,
    Score,
    Rate,
    Generic,
}

impl MetricCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Temperature => "temp",
            Self::Score => "score",
            Self::Rate => "rate",
            Self::Generic => "generic",
        }
    }
}

/// Everything the grouping rules need from one title.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketFeatures {
    /// (home, away) when the title is a matchup pattern.
    pub teams: Option<(String, String)>,
    pub date: Option<NaiveDate>,
    pub threshold: Option<f64>,
    pub metric: MetricCategory,
    pub direction: Option<Direction>,
    /// Subject of a non-matchup market ("bitcoin", "federal reserve", ...).
    pub entity: Option<String>,
}

/// Extract features from a normalized title. `reference` resolves yearless
/// date formats (MM/DD, "march 1").
pub fn extract_features(normalized: &str, reference: NaiveDate) -> MarketFeatures {
    // Date fragments confuse the other extractors ("knicks 3/1" is not a
    // team, "3/1" is not a threshold), so parse dates first and mask them.
    let date = extract_date(normalized, reference);
    let masked = mask_dates(normalized);

    let teams = extract_teams(&masked);
    let direction = extract_direction(normalized);
    let threshold = extract_threshold(&masked);
    let metric = extract_metric(normalized);
    let entity = if teams.is_none() {
        extract_entity(normalized)
    } else {
        None
    };

    MarketFeatures {
        teams,
        date,
        threshold,
        metric,
        direction,
        entity,
    }
}

fn mask_dates(s: &str) -> String {
    let mut masked = ISO_DATE_RE.replace_all(s, " ").to_string();
    masked = SLASH_DATE_RE.replace_all(&masked, " ").to_string();
    MONTH_DAY_RE.replace_all(&masked, " ").to_string()
}

fn extract_teams(masked: &str) -> Option<(String, String)> {
    let trimmed = masked.trim();
    let caps = MATCHUP_RE.captures(trimmed)?;
    let home = caps.get(1)?.as_str().trim();
    let away = caps.get(2)?.as_str().trim();
    // A side that is empty or leads with a digit is a score or a threshold,
    // not a team ("bitcoin at 70k").
    let is_team = |s: &str| s.chars().next().is_some_and(|c| c.is_alphabetic());
    if !is_team(home) || !is_team(away) {
        return None;
    }
    Some((home.to_string(), away.to_string()))
}

fn extract_date(normalized: &str, reference: NaiveDate) -> Option<NaiveDate> {
    if let Some(caps) = ISO_DATE_RE.captures(normalized) {
        let y: i32 = caps[1].parse().ok()?;
        let m: u32 = caps[2].parse().ok()?;
        let d: u32 = caps[3].parse().ok()?;
        return NaiveDate::from_ymd_opt(y, m, d);
    }

    if let Some(caps) = MONTH_DAY_RE.captures(normalized) {
        let month = month_number(&caps[1])?;
        let day: u32 = caps[2].parse().ok()?;
        return resolve_yearless(month, day, reference);
    }

    if let Some(caps) = SLASH_DATE_RE.captures(normalized) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        if (1..=12).contains(&month) {
            return resolve_yearless(month, day, reference);
        }
    }

    None
}

/// Yearless dates resolve to the reference year, rolling forward when that
/// day is more than six months in the past (venues list upcoming events).
fn resolve_yearless(month: u32, day: u32, reference: NaiveDate) -> Option<NaiveDate> {
    let candidate = NaiveDate::from_ymd_opt(reference.year(), month, day)?;
    if (reference - candidate).num_days() > 183 {
        NaiveDate::from_ymd_opt(reference.year() + 1, month, day)
    } else {
        Some(candidate)
    }
}

fn month_number(name: &str) -> Option<u32> {
    Some(match name {
        "january" => 1,
        "february" => 2,
        "march" => 3,
        "april" => 4,
        "may" => 5,
        "june" => 6,
        "july" => 7,
        "august" => 8,
        "september" => 9,
        "october" => 10,
        "november" => 11,
        "december" => 12,
        _ => return None,
    })
}

fn extract_direction(normalized: &str) -> Option<Direction> {
    for token in normalized.split_whitespace() {
        match token {
            "above" | "over" | "exceed" | "exceeds" | "higher" => return Some(Direction::Above),
            "below" | "under" | "less" | "lower" => return Some(Direction::Below),
            "win" | "wins" | "beat" | "beats" | "defeat" | "defeats" => {
                return Some(Direction::Wins)
            }
            "lose" | "loses" => return Some(Direction::Loses),
            _ => {}
        }
    }
    None
}

/// First number that is not part of a date, with K/M/B and unit handling.
/// Callers pass a date-masked title so "3/1" never reads as a number.
fn extract_threshold(masked: &str) -> Option<f64> {
    for caps in THRESHOLD_RE.captures_iter(masked) {
        let raw = caps.get(1)?.as_str();
        let value: f64 = raw.parse().ok()?;
        let multiplier = match caps.get(2).map(|m| m.as_str()) {
            Some("k") => 1_000.0,
            Some("m") => 1_000_000.0,
            Some("b") => 1_000_000_000.0,
            _ => 1.0,
        };
        return Some(value * multiplier);
    }
    None
}

fn extract_metric(normalized: &str) -> MetricCategory {
    if normalized.contains('°')
        || normalized.contains("degree")
        || normalized.contains("temperature")
    {
        MetricCategory::Temperature
    } else if normalized.contains('$')
        || normalized.contains("price")
        || normalized.contains("close")
        || normalized.contains("trading")
    {
        MetricCategory::Price
    } else if normalized.contains("score")
        || normalized.contains("points")
        || normalized.contains("goals")
    {
        MetricCategory::Score
    } else if normalized.contains('%')
        || normalized.contains("rate")
        || normalized.contains("inflation")
        || normalized.contains("cpi")
        || normalized.contains("yield")
    {
        MetricCategory::Rate
    } else {
        MetricCategory::Generic
    }
}

/// Words before the first direction/metric keyword, minus filler.
fn extract_entity(normalized: &str) -> Option<String> {
    const FILLER: [&str; 6] = ["will", "the", "be", "a", "an", "to"];
    const STOP_AT: [&str; 16] = [
        "above", "over", "exceed", "exceeds", "higher", "below", "under", "less", "lower", "win",
        "wins", "beat", "beats", "lose", "loses", "close",
    ];

    let mut words = Vec::new();
    for token in normalized.split_whitespace() {
        if STOP_AT.contains(&token) {
            break;
        }
        if FILLER.contains(&token) || token.chars().all(|c| !c.is_alphabetic()) {
            continue;
        }
        words.push(token);
    }
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 2, 15).unwrap()
    }

    #[test]
    fn extracts_matchup_teams() {
        let f = extract_features("boston celtics vs new york knicks", reference());
        assert_eq!(
            f.teams,
            Some(("boston celtics".to_string(), "new york knicks".to_string()))
        );
        assert!(f.entity.is_none());
    }

    #[test]
    fn extracts_iso_and_yearless_dates() {
        let f = extract_features("celtics vs knicks on 2025-03-01", reference());
        assert_eq!(f.date, NaiveDate::from_ymd_opt(2025, 3, 1));

        let f = extract_features("celtics vs knicks 3/1", reference());
        assert_eq!(f.date, NaiveDate::from_ymd_opt(2025, 3, 1));

        let f = extract_features("bitcoin above 70k march 1", reference());
        assert_eq!(f.date, NaiveDate::from_ymd_opt(2025, 3, 1));
    }

    #[test]
    fn yearless_date_rolls_forward_past_six_months() {
        // Reference is Feb 2025; "july 1" is ahead, "january 3" just passed.
        let f = extract_features("bitcoin above 70k january 3", reference());
        assert_eq!(f.date, NaiveDate::from_ymd_opt(2025, 1, 3));

        let late_ref = NaiveDate::from_ymd_opt(2025, 11, 20).unwrap();
        let f = extract_features("bitcoin above 70k january 3", late_ref);
        assert_eq!(f.date, NaiveDate::from_ymd_opt(2026, 1, 3));
    }

    #[test]
    fn extracts_threshold_with_multipliers() {
        let f = extract_features("bitcoin above $70k on 2025-03-01", reference());
        assert_eq!(f.threshold, Some(70_000.0));
        assert_eq!(f.direction, Some(Direction::Above));
        assert_eq!(f.metric, MetricCategory::Price);

        let f = extract_features("ethereum market cap above 1.5b", reference());
        assert_eq!(f.threshold, Some(1_500_000_000.0));
    }

    #[test]
    fn threshold_skips_date_fragments() {
        let f = extract_features("bitcoin above 70000 on 3/1", reference());
        assert_eq!(f.threshold, Some(70_000.0));
    }

    #[test]
    fn extracts_temperature_markets() {
        let f = extract_features("austin high temp above 70° on 3/1", reference());
        assert_eq!(f.metric, MetricCategory::Temperature);
        assert_eq!(f.threshold, Some(70.0));
        assert_eq!(f.direction, Some(Direction::Above));
        assert_eq!(f.entity.as_deref(), Some("austin high temp"));
    }

    #[test]
    fn direction_families_and_opposition() {
        assert_eq!(Direction::Above.family(), Direction::Below.family());
        assert!(Direction::Above.is_opposing(Direction::Below));
        assert!(Direction::Wins.is_opposing(Direction::Loses));
        assert!(!Direction::Above.is_opposing(Direction::Above));
        assert!(!Direction::Above.is_opposing(Direction::Wins));
    }

    #[test]
    fn entity_for_threshold_market() {
        let f = extract_features("will bitcoin close above $70000", reference());
        assert_eq!(f.entity.as_deref(), Some("bitcoin"));
    }
}
