// =============================================================================
// Matcher — pure rule-based grouping of venue markets into shared events
// =============================================================================
//
// `match_markets` is deterministic and side-effect free: the same input set
// and reference instant always produce the same TrackedEvents. The registry
// owns storage; this module only computes.
//
// Rules, in order: normalize titles → extract features → derive an event key
// → group by key → validate (≥2 venues, time agreement, one market per
// venue) → score quality → annotate opposing-direction groups for the
// evaluator's flip pairing.
// =============================================================================

pub mod features;
pub mod normalize;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::types::{EventStatus, TrackedEvent, VenueMarket};
use features::{extract_features, MarketFeatures};
use normalize::normalize_title;

/// Confidence contribution of each matched feature.
const WEIGHT_TEAMS: f64 = 0.40;
const WEIGHT_DATE: f64 = 0.25;
const WEIGHT_THRESHOLD: f64 = 0.15;
const WEIGHT_METRIC: f64 = 0.10;
const WEIGHT_DIRECTION: f64 = 0.10;

/// Thresholds match when within 1 % of each other.
const THRESHOLD_MATCH_RATIO: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Start-time agreement window for members of one group.
    pub time_tolerance_mins: i64,
    /// Groups scoring below this are discarded.
    pub min_quality: f64,
    /// Ignore non-matchup markets entirely.
    pub sports_only: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            time_tolerance_mins: 30,
            min_quality: 0.70,
            sports_only: false,
        }
    }
}

struct Candidate {
    market: VenueMarket,
    features: MarketFeatures,
}

/// Group `markets` into tracked events.
///
/// `reference` anchors yearless date parsing and stamps the produced events;
/// passing the same instant twice yields identical output (idempotence).
pub fn match_markets(
    markets: &[VenueMarket],
    reference: DateTime<Utc>,
    cfg: &MatcherConfig,
) -> Vec<TrackedEvent> {
    let reference_date = reference.date_naive();

    // 1–3. Normalize, extract, key.
    let mut groups: HashMap<String, Vec<Candidate>> = HashMap::new();
    for market in markets {
        let normalized = normalize_title(&market.title);
        let feats = extract_features(&normalized, reference_date);

        if cfg.sports_only && feats.teams.is_none() {
            continue;
        }

        let Some(key) = derive_event_key(market, &feats) else {
            continue;
        };

        groups.entry(key).or_default().push(Candidate {
            market: market.clone(),
            features: feats,
        });
    }

    // 4–7. Validate, dedupe, score, annotate.
    let mut events: Vec<TrackedEvent> = Vec::new();
    for (key, candidates) in groups {
        let Some(event) = build_event(key, candidates, reference, cfg) else {
            continue;
        };
        events.push(event);
    }

    events.sort_by(|a, b| a.event_key.cmp(&b.event_key));
    events
}

/// Canonical grouping key for one market, or `None` when the title carries
/// too little structure to group on.
fn derive_event_key(market: &VenueMarket, feats: &MarketFeatures) -> Option<String> {
    let date = feats
        .date
        .or_else(|| market.start_time.map(|t| t.date_naive()));
    let date_part = date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "tbd".to_string());

    if let Some((home, away)) = &feats.teams {
        let sport = sport_family(market.sport.as_deref());
        let (a, b) = if home <= away {
            (home, away)
        } else {
            (away, home)
        };
        return Some(format!("{sport}|{date_part}|{a},{b}"));
    }

    // Prediction markets need a subject; opposing directions collapse into
    // one family so "above 70" and "below 70" listings share a key.
    let entity = feats.entity.as_deref()?;
    let threshold_part = feats
        .threshold
        .map(format_threshold)
        .unwrap_or_else(|| "na".to_string());
    let family = feats.direction.map(|d| d.family()).unwrap_or("none");
    Some(format!(
        "{}|{}|{}|{}|{}",
        feats.metric.as_str(),
        entity,
        date_part,
        threshold_part,
        family
    ))
}

/// Collapse venue-specific sport labels onto one family.
fn sport_family(sport: Option<&str>) -> String {
    let Some(s) = sport else {
        return "sports".to_string();
    };
    match s.to_lowercase().as_str() {
        "nba" | "basketball" | "ncaab" => "basketball".to_string(),
        "nfl" | "football" | "ncaaf" => "football".to_string(),
        "mlb" | "baseball" => "baseball".to_string(),
        "nhl" | "hockey" => "hockey".to_string(),
        "epl" | "soccer" | "football-uk" | "premier league" => "soccer".to_string(),
        other => other.to_string(),
    }
}

fn format_threshold(t: f64) -> String {
    if t.fract() == 0.0 {
        format!("{}", t as i64)
    } else {
        format!("{t:.2}")
    }
}

/// Validate one candidate group and turn it into a TrackedEvent.
fn build_event(
    key: String,
    mut candidates: Vec<Candidate>,
    reference: DateTime<Utc>,
    cfg: &MatcherConfig,
) -> Option<TrackedEvent> {
    // At most one market per venue: tie-break on liquidity, then volume.
    candidates.sort_by(|a, b| {
        (b.market.liquidity_usd + b.market.volume_usd)
            .partial_cmp(&(a.market.liquidity_usd + a.market.volume_usd))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut per_venue: Vec<Candidate> = Vec::new();
    for cand in candidates {
        if !per_venue.iter().any(|c| c.market.venue == cand.market.venue) {
            per_venue.push(cand);
        }
    }

    if per_venue.len() < 2 {
        return None;
    }

    // Members' start times must agree within the tolerance.
    let starts: Vec<DateTime<Utc>> =
        per_venue.iter().filter_map(|c| c.market.start_time).collect();
    if let (Some(min), Some(max)) = (starts.iter().min(), starts.iter().max()) {
        if (*max - *min).num_minutes() > cfg.time_tolerance_mins {
            return None;
        }
    }

    // Average pairwise quality.
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..per_venue.len() {
        for j in (i + 1)..per_venue.len() {
            total += pair_quality(&per_venue[i], &per_venue[j], cfg.time_tolerance_mins);
            pairs += 1;
        }
    }
    let quality = if pairs > 0 { total / pairs as f64 } else { 0.0 };
    if quality < cfg.min_quality {
        return None;
    }

    // Opposing direction modifiers flip the evaluator's side pairing.
    let mut opposing = false;
    'outer: for i in 0..per_venue.len() {
        for j in (i + 1)..per_venue.len() {
            if let (Some(da), Some(db)) =
                (per_venue[i].features.direction, per_venue[j].features.direction)
            {
                if da.is_opposing(db) {
                    opposing = true;
                    break 'outer;
                }
            }
        }
    }

    // Stable member order keeps refresh diffs meaningful.
    per_venue.sort_by(|a, b| {
        a.market
            .venue
            .as_str()
            .cmp(b.market.venue.as_str())
            .then_with(|| a.market.id.cmp(&b.market.id))
    });

    let teams = per_venue.iter().find_map(|c| c.features.teams.clone());
    let sport = per_venue.iter().find_map(|c| c.market.sport.clone());

    Some(TrackedEvent {
        event_key: key,
        sport,
        home_team: teams.as_ref().map(|(h, _)| h.clone()),
        away_team: teams.as_ref().map(|(_, a)| a.clone()),
        // Real status is assigned by the registry at swap time.
        status: EventStatus::Pre,
        members: per_venue.into_iter().map(|c| c.market).collect(),
        match_quality: quality,
        opposing_sides: opposing,
        first_seen_at: reference,
        last_refreshed_at: reference,
        opportunities_found: 0,
    })
}

/// Weighted similarity between two candidates, normalized over the weights
/// that are applicable to this pair (a threshold market can never earn the
/// team weight, and must not be punished for it).
fn pair_quality(a: &Candidate, b: &Candidate, tolerance_mins: i64) -> f64 {
    let mut earned = 0.0;
    let mut applicable = 0.0;

    if a.features.teams.is_some() || b.features.teams.is_some() {
        applicable += WEIGHT_TEAMS;
        if let (Some(ta), Some(tb)) = (&a.features.teams, &b.features.teams) {
            if sorted_pair(ta) == sorted_pair(tb) {
                earned += WEIGHT_TEAMS;
            }
        }
    }

    if a.features.date.is_some()
        || b.features.date.is_some()
        || (a.market.start_time.is_some() && b.market.start_time.is_some())
    {
        applicable += WEIGHT_DATE;
        let date_ok = match (a.market.start_time, b.market.start_time) {
            (Some(sa), Some(sb)) => (sa - sb).num_minutes().abs() <= tolerance_mins,
            _ => match (a.features.date, b.features.date) {
                (Some(da), Some(db)) => da == db,
                _ => false,
            },
        };
        if date_ok {
            earned += WEIGHT_DATE;
        }
    }

    if a.features.threshold.is_some() || b.features.threshold.is_some() {
        applicable += WEIGHT_THRESHOLD;
        if let (Some(ta), Some(tb)) = (a.features.threshold, b.features.threshold) {
            let base = ta.abs().max(tb.abs());
            if base > 0.0 && ((ta - tb).abs() / base) <= THRESHOLD_MATCH_RATIO {
                earned += WEIGHT_THRESHOLD;
            }
        }
    }

    applicable += WEIGHT_METRIC;
    if a.features.metric == b.features.metric {
        earned += WEIGHT_METRIC;
    }

    if a.features.direction.is_some() || b.features.direction.is_some() {
        applicable += WEIGHT_DIRECTION;
        if let (Some(da), Some(db)) = (a.features.direction, b.features.direction) {
            if da == db || da.is_opposing(db) {
                earned += WEIGHT_DIRECTION;
            }
        }
    }

    if applicable == 0.0 {
        return 0.0;
    }
    earned / applicable
}

fn sorted_pair(pair: &(String, String)) -> (String, String) {
    let (h, a) = pair;
    if h <= a {
        (h.clone(), a.clone())
    } else {
        (a.clone(), h.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Venue;
    use chrono::TimeZone;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 15, 12, 0, 0).unwrap()
    }

    fn market(
        venue: Venue,
        id: &str,
        title: &str,
        sport: Option<&str>,
        start: Option<DateTime<Utc>>,
    ) -> VenueMarket {
        VenueMarket {
            id: id.to_string(),
            venue,
            kind: venue.market_kind(),
            title: title.to_string(),
            home_team: None,
            away_team: None,
            sport: sport.map(|s| s.to_string()),
            start_time: start,
            close_time: reference() + chrono::Duration::days(30),
            yes_price_cents: Some(50.0),
            no_price_cents: Some(50.0),
            yes_decimal_odds: None,
            no_decimal_odds: None,
            liquidity_usd: 10_000.0,
            volume_usd: 5_000.0,
        }
    }

    #[test]
    fn groups_prediction_markets_across_venues() {
        let markets = vec![
            market(
                Venue::Kalshi,
                "k1",
                "Will Bitcoin close above $70K on 2025-03-01?",
                None,
                None,
            ),
            market(
                Venue::Polymarket,
                "p1",
                "BTC above $70,000 on March 1",
                None,
                None,
            ),
        ];
        let events = match_markets(&markets, reference(), &MatcherConfig::default());
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.members.len(), 2);
        assert!(ev.event_key.starts_with("price|bitcoin|2025-03-01|70000|"));
        assert!(!ev.opposing_sides);
        assert!(ev.match_quality >= 0.70);
    }

    #[test]
    fn opposing_directions_share_a_key_and_set_flip_flag() {
        let markets = vec![
            market(
                Venue::Kalshi,
                "k1",
                "Austin temp above 70° on 3/1",
                None,
                None,
            ),
            market(
                Venue::Polymarket,
                "p1",
                "Austin temp below 70° on 3/1",
                None,
                None,
            ),
        ];
        let events = match_markets(&markets, reference(), &MatcherConfig::default());
        assert_eq!(events.len(), 1);
        assert!(events[0].opposing_sides);
    }

    #[test]
    fn single_venue_groups_are_discarded() {
        let markets = vec![
            market(Venue::Kalshi, "k1", "Bitcoin above $70K on 3/1", None, None),
            market(Venue::Kalshi, "k2", "BTC above 70000 on 3/1", None, None),
        ];
        let events = match_markets(&markets, reference(), &MatcherConfig::default());
        assert!(events.is_empty());
    }

    #[test]
    fn same_venue_duplicate_keeps_highest_liquidity() {
        let mut low = market(Venue::Kalshi, "k-low", "BTC above $70K on 3/1", None, None);
        low.liquidity_usd = 1_000.0;
        let mut high = market(Venue::Kalshi, "k-high", "Bitcoin above $70K on 3/1", None, None);
        high.liquidity_usd = 50_000.0;
        let other = market(Venue::Polymarket, "p1", "Bitcoin above $70000 on 3/1", None, None);

        let events = match_markets(&[low, high, other], reference(), &MatcherConfig::default());
        assert_eq!(events.len(), 1);
        let kalshi_member = events[0]
            .members
            .iter()
            .find(|m| m.venue == Venue::Kalshi)
            .unwrap();
        assert_eq!(kalshi_member.id, "k-high");
    }

    #[test]
    fn sports_matchup_groups_across_alias_and_sport_labels() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 19, 30, 0).unwrap();
        let markets = vec![
            market(Venue::Kalshi, "k1", "LAL @ GSW", Some("nba"), Some(start)),
            market(
                Venue::SxBet,
                "s1",
                "Los Angeles Lakers vs Golden State Warriors",
                Some("basketball"),
                Some(start + chrono::Duration::minutes(5)),
            ),
        ];
        let events = match_markets(&markets, reference(), &MatcherConfig::default());
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(
            ev.event_key,
            "basketball|2025-03-01|golden state warriors,los angeles lakers"
        );
    }

    #[test]
    fn start_time_disagreement_discards_group() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 19, 30, 0).unwrap();
        let markets = vec![
            market(Venue::Kalshi, "k1", "LAL @ GSW", Some("nba"), Some(start)),
            market(
                Venue::SxBet,
                "s1",
                "Los Angeles Lakers vs Golden State Warriors",
                Some("basketball"),
                Some(start + chrono::Duration::hours(2)),
            ),
        ];
        let events = match_markets(&markets, reference(), &MatcherConfig::default());
        assert!(events.is_empty());
    }

    #[test]
    fn sports_only_skips_threshold_markets() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 19, 30, 0).unwrap();
        let markets = vec![
            market(Venue::Kalshi, "k1", "Bitcoin above $70K on 3/1", None, None),
            market(Venue::Polymarket, "p1", "BTC above $70000 on 3/1", None, None),
            market(Venue::Kalshi, "k2", "LAL @ GSW", Some("nba"), Some(start)),
            market(Venue::SxBet, "s1", "LAL vs GSW", Some("basketball"), Some(start)),
        ];
        let cfg = MatcherConfig {
            sports_only: true,
            ..MatcherConfig::default()
        };
        let events = match_markets(&markets, reference(), &cfg);
        assert_eq!(events.len(), 1);
        assert!(events[0].event_key.starts_with("basketball|"));
    }

    #[test]
    fn matcher_is_idempotent() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 19, 30, 0).unwrap();
        let markets = vec![
            market(Venue::Kalshi, "k1", "Bitcoin above $70K on 3/1", None, None),
            market(Venue::Polymarket, "p1", "BTC above $70000 on 3/1", None, None),
            market(Venue::Kalshi, "k2", "LAL @ GSW", Some("nba"), Some(start)),
            market(Venue::SxBet, "s1", "LAL vs GSW", Some("basketball"), Some(start)),
        ];
        let cfg = MatcherConfig::default();
        let a = match_markets(&markets, reference(), &cfg);
        let b = match_markets(&markets, reference(), &cfg);
        let keys_a: Vec<_> = a.iter().map(|e| &e.event_key).collect();
        let keys_b: Vec<_> = b.iter().map(|e| &e.event_key).collect();
        assert_eq!(keys_a, keys_b);
        assert_eq!(a.len(), 2);
    }
}
