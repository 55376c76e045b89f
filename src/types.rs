// =============================================================================
// Shared types used across the Polaris arbitrage worker
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A trading venue carrying binary markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Kalshi,
    Polymarket,
    SxBet,
}

impl Venue {
    pub const ALL: [Venue; 3] = [Venue::Kalshi, Venue::Polymarket, Venue::SxBet];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kalshi => "kalshi",
            Self::Polymarket => "polymarket",
            Self::SxBet => "sxbet",
        }
    }

    /// What this venue quotes: cent prices or decimal odds.
    pub fn market_kind(&self) -> MarketKind {
        match self {
            Self::Kalshi | Self::Polymarket => MarketKind::Prediction,
            Self::SxBet => MarketKind::Sportsbook,
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    /// The opposite side of this outcome.
    pub fn complement(&self) -> Self {
        match self {
            Self::Yes => Self::No,
            Self::No => Self::Yes,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yes => write!(f, "YES"),
            Self::No => write!(f, "NO"),
        }
    }
}

/// Where a cached price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Stream,
    Snapshot,
    Rest,
}

impl std::fmt::Display for PriceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::Rest => write!(f, "rest"),
        }
    }
}

/// Identity of a single cached price: one outcome of one market on one venue.
/// Market ids are case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceKey {
    pub venue: Venue,
    pub market_id: String,
    pub outcome: Outcome,
}

impl PriceKey {
    pub fn new(venue: Venue, market_id: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            venue,
            market_id: market_id.into(),
            outcome,
        }
    }
}

impl std::fmt::Display for PriceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.venue, self.market_id, self.outcome)
    }
}

/// A normalized inbound price observation produced by a venue stream client
/// and written to the price cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub key: PriceKey,
    /// Price in cents (0–100).
    pub price_cents: f64,
    /// Implied probability in (0,1), kept to 6 decimal digits.
    pub implied: f64,
    pub source: PriceSource,
    /// Wall-clock ingress timestamp, milliseconds since the epoch.
    pub observed_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
    /// Taker decimal odds, sportsbook points only. Always ≥ 1.01.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimal_odds: Option<f64>,
}

/// The freshest known price for a key, as stored by the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub price_cents: f64,
    pub implied: f64,
    pub source: PriceSource,
    pub observed_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimal_odds: Option<f64>,
}

impl PricePoint {
    pub fn from_update(u: &PriceUpdate) -> Self {
        Self {
            price_cents: u.price_cents,
            implied: u.implied,
            source: u.source,
            observed_at_ms: u.observed_at_ms,
            best_bid: u.best_bid,
            best_ask: u.best_ask,
            spread: u.spread,
            decimal_odds: u.decimal_odds,
        }
    }

    /// Age of this point relative to `now_ms`, clamped at zero.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.observed_at_ms).max(0)
    }
}

/// Prediction markets quote cent prices; sportsbook markets quote decimal odds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Prediction,
    Sportsbook,
}

/// A single venue's listing of a market, as seen in the most recent snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueMarket {
    pub id: String,
    pub venue: Venue,
    pub kind: MarketKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub away_team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    pub close_time: DateTime<Utc>,
    /// Snapshot YES price in cents, used as the stale-stream fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yes_price_cents: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_price_cents: Option<f64>,
    /// Taker decimal odds per side, sportsbook listings only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yes_decimal_odds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_decimal_odds: Option<f64>,
    #[serde(default)]
    pub liquidity_usd: f64,
    #[serde(default)]
    pub volume_usd: f64,
}

impl VenueMarket {
    /// Snapshot price for one outcome, in cents.
    pub fn snapshot_price_cents(&self, outcome: Outcome) -> Option<f64> {
        match outcome {
            Outcome::Yes => self.yes_price_cents,
            Outcome::No => self.no_price_cents,
        }
    }

    pub fn snapshot_decimal_odds(&self, outcome: Outcome) -> Option<f64> {
        match outcome {
            Outcome::Yes => self.yes_decimal_odds,
            Outcome::No => self.no_decimal_odds,
        }
    }
}

/// Result of one discovery pass across all venues.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub markets: Vec<VenueMarket>,
}

/// Lifecycle status of a tracked event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pre,
    Live,
    Ended,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pre => write!(f, "PRE"),
            Self::Live => write!(f, "LIVE"),
            Self::Ended => write!(f, "ENDED"),
        }
    }
}

/// A group of venue markets judged to represent the same real-world event.
/// Always holds members from at least two distinct venues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEvent {
    pub event_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub away_team: Option<String>,
    pub status: EventStatus,
    pub members: Vec<VenueMarket>,
    /// Matcher confidence in [0,1].
    pub match_quality: f64,
    /// True when grouped markets carry opposing direction modifiers, so the
    /// evaluator must pair YES with YES instead of YES with NO.
    #[serde(default)]
    pub opposing_sides: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_refreshed_at: DateTime<Utc>,
    #[serde(default)]
    pub opportunities_found: u64,
}

impl TrackedEvent {
    /// Whether `market_id` on `venue` is one of this event's members.
    pub fn contains(&self, venue: Venue, market_id: &str) -> bool {
        self.members
            .iter()
            .any(|m| m.venue == venue && m.id == market_id)
    }
}

/// One leg of a detected arbitrage pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityLeg {
    pub venue: Venue,
    pub market_id: String,
    pub side: Outcome,
    pub price_cents: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimal_odds: Option<f64>,
    pub observed_at_ms: i64,
    pub age_ms: i64,
    pub source: PriceSource,
}

/// A cross-venue two-leg arbitrage detection. Emission is the end of this
/// worker's responsibility; execution is a pluggable adapter's decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    pub event_key: String,
    pub leg_a: OpportunityLeg,
    pub leg_b: OpportunityLeg,
    /// Guaranteed profit per contract in dollars (payout 1.00).
    pub profit_abs: f64,
    pub profit_pct: f64,
    pub skew_ms: i64,
    #[serde(default)]
    pub flipped: bool,
    /// Estimated combined taker fees per contract, in cents.
    #[serde(default)]
    pub fee_cents: f64,
    pub detected_at: DateTime<Utc>,
}

impl Opportunity {
    /// Deterministic id so repeated detections of the same pair within the
    /// same second are idempotent downstream.
    pub fn make_id(
        event_key: &str,
        leg_a: &OpportunityLeg,
        leg_b: &OpportunityLeg,
        detected_at_sec: i64,
    ) -> String {
        format!(
            "{event_key}|{}|{}|{detected_at_sec}",
            leg_a.market_id, leg_b.market_id
        )
    }
}

/// Worker lifecycle state, published through the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Starting,
    Running,
    Idle,
    Stopping,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Idle => write!(f, "IDLE"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Round an implied probability to the 6 decimal digits we store.
pub fn round_implied(p: f64) -> f64 {
    (p * 1_000_000.0).round() / 1_000_000.0
}

/// Wall-clock now in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_complement() {
        assert_eq!(Outcome::Yes.complement(), Outcome::No);
        assert_eq!(Outcome::No.complement(), Outcome::Yes);
    }

    #[test]
    fn price_key_display_is_case_sensitive() {
        let a = PriceKey::new(Venue::Kalshi, "ABC-123", Outcome::Yes);
        let b = PriceKey::new(Venue::Kalshi, "abc-123", Outcome::Yes);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "kalshi:ABC-123:YES");
    }

    #[test]
    fn implied_rounding_keeps_six_digits() {
        assert_eq!(round_implied(0.123_456_789), 0.123_457);
        assert_eq!(round_implied(1.0 / 3.0), 0.333_333);
    }

    #[test]
    fn opportunity_id_is_deterministic() {
        let leg = |id: &str| OpportunityLeg {
            venue: Venue::Kalshi,
            market_id: id.to_string(),
            side: Outcome::Yes,
            price_cents: 55.0,
            decimal_odds: None,
            observed_at_ms: 0,
            age_ms: 0,
            source: PriceSource::Stream,
        };
        let a = leg("m1");
        let b = leg("m2");
        let id1 = Opportunity::make_id("soccer|2025-03-01|x,y", &a, &b, 1_700_000_000);
        let id2 = Opportunity::make_id("soccer|2025-03-01|x,y", &a, &b, 1_700_000_000);
        assert_eq!(id1, id2);
        assert_eq!(id1, "soccer|2025-03-01|x,y|m1|m2|1700000000");
    }

    #[test]
    fn worker_state_serializes_screaming() {
        let json = serde_json::to_string(&WorkerState::Stopping).unwrap();
        assert_eq!(json, "\"STOPPING\"");
    }
}
