// =============================================================================
// Runtime Configuration — remotely toggled worker settings
// =============================================================================
//
// The controller writes a single JSON object into the KV store; the worker
// polls it each main-loop tick so it can be reconfigured (or switched off)
// without a restart.
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// reading an older config object, and a reader never fails on a partial one.
//
// =============================================================================

use serde::{Deserialize, Serialize};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_min_profit_bps() -> u32 {
    50
}

fn default_max_price_age_ms() -> i64 {
    2_000
}

fn default_max_skew_ms() -> i64 {
    500
}

fn default_max_slippage_bps() -> u32 {
    100
}

fn default_max_subscriptions_per_venue() -> usize {
    100
}

fn default_refresh_interval_ms() -> u64 {
    15_000
}

fn default_eval_throttle_ms() -> i64 {
    100
}

fn default_match_time_tolerance_mins() -> i64 {
    30
}

fn default_min_match_quality() -> f64 {
    0.70
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_ms() -> i64 {
    60_000
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Remotely controlled settings for the arbitrage worker.
///
/// Serialized as camelCase to match the controller's JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    // --- Master switches -----------------------------------------------------

    /// Whether the live pipeline (stream clients, evaluator) should run at
    /// all. Off means the worker idles and only heartbeats.
    #[serde(default)]
    pub live_arb_enabled: bool,

    /// Whether the rule-based matcher runs during snapshot refresh.
    #[serde(default = "default_true")]
    pub rule_based_matcher_enabled: bool,

    /// Restrict tracking to sports matchup events.
    #[serde(default)]
    pub sports_only: bool,

    /// Restrict subscriptions to events currently LIVE.
    #[serde(default)]
    pub live_events_only: bool,

    // --- Evaluator thresholds ------------------------------------------------

    /// Minimum profit to emit, in basis points (50 = 0.5 %). Inclusive.
    #[serde(default = "default_min_profit_bps")]
    pub min_profit_bps: u32,

    /// A leg older than this is stale and blocks the pair.
    #[serde(default = "default_max_price_age_ms")]
    pub max_price_age_ms: i64,

    /// Maximum observation-timestamp skew between the two legs.
    #[serde(default = "default_max_skew_ms")]
    pub max_skew_ms: i64,

    /// Maximum tolerated half-spread from mid, in basis points.
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: u32,

    /// Minimum gap between evaluations of the same event.
    #[serde(default = "default_eval_throttle_ms")]
    pub eval_throttle_ms: i64,

    // --- Subscription / refresh ----------------------------------------------

    /// Per-venue cap on concurrently subscribed markets.
    #[serde(default = "default_max_subscriptions_per_venue")]
    pub max_subscriptions_per_venue: usize,

    /// Market snapshot refresh cadence for the main loop.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    // --- Matcher tolerances --------------------------------------------------

    /// Start-time agreement window for grouping markets into one event.
    #[serde(default = "default_match_time_tolerance_mins")]
    pub match_time_tolerance_mins: i64,

    /// Groups scoring below this similarity are discarded.
    #[serde(default = "default_min_match_quality")]
    pub min_match_quality: f64,

    // --- Circuit breaker -----------------------------------------------------

    /// Consecutive executor failures before the breaker opens.
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    /// How long the breaker stays open before auto-resetting.
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            live_arb_enabled: false,
            rule_based_matcher_enabled: true,
            sports_only: false,
            live_events_only: false,
            min_profit_bps: default_min_profit_bps(),
            max_price_age_ms: default_max_price_age_ms(),
            max_skew_ms: default_max_skew_ms(),
            max_slippage_bps: default_max_slippage_bps(),
            eval_throttle_ms: default_eval_throttle_ms(),
            max_subscriptions_per_venue: default_max_subscriptions_per_venue(),
            refresh_interval_ms: default_refresh_interval_ms(),
            match_time_tolerance_mins: default_match_time_tolerance_mins(),
            min_match_quality: default_min_match_quality(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Minimum profit threshold as a percentage (50 bps → 0.5).
    pub fn min_profit_pct(&self) -> f64 {
        self.min_profit_bps as f64 / 100.0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert!(!cfg.live_arb_enabled);
        assert!(cfg.rule_based_matcher_enabled);
        assert_eq!(cfg.min_profit_bps, 50);
        assert_eq!(cfg.max_price_age_ms, 2_000);
        assert_eq!(cfg.max_skew_ms, 500);
        assert_eq!(cfg.max_slippage_bps, 100);
        assert_eq!(cfg.max_subscriptions_per_venue, 100);
        assert_eq!(cfg.refresh_interval_ms, 15_000);
        assert!((cfg.min_match_quality - 0.70).abs() < f64::EPSILON);
        assert_eq!(cfg.breaker_failure_threshold, 5);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "liveArbEnabled": true, "minProfitBps": 75 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.live_arb_enabled);
        assert_eq!(cfg.min_profit_bps, 75);
        assert_eq!(cfg.max_price_age_ms, 2_000);
        assert_eq!(cfg.match_time_tolerance_mins, 30);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let json = r#"{ "liveArbEnabled": true, "someFutureKnob": 42 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.live_arb_enabled);
    }

    #[test]
    fn roundtrip_serialization() {
        let mut cfg = RuntimeConfig::default();
        cfg.live_arb_enabled = true;
        cfg.sports_only = true;
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"liveArbEnabled\":true"));
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, cfg2);
    }

    #[test]
    fn min_profit_pct_conversion() {
        let cfg = RuntimeConfig::default();
        assert!((cfg.min_profit_pct() - 0.5).abs() < f64::EPSILON);
    }
}
