// =============================================================================
// Safety Gates & Circuit Breaker — the last checks before an opportunity ships
// =============================================================================
//
// Gates run in a fixed order and the first failure blocks the opportunity
// with a reason tag:
//
//   1. freshness       — each leg strictly younger than maxPriceAgeMs
//   2. skew            — leg observation timestamps within maxSkewMs
//   3. slippage        — quoted half-spread from mid within maxSlippageBps
//   4. profitValidity  — profit re-priced from the cache at check time still
//                        clears; catches a leg that moved since evaluation
//   5. breakerOpen     — the circuit breaker must be CLOSED
//
// The breaker trips after N consecutive executor failures and auto-resets
// after its cooldown. Blocked counts per tag feed the heartbeat.
// =============================================================================

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::price_cache::EffectivePrice;
use crate::runtime_config::RuntimeConfig;
use crate::types::Opportunity;

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
}

/// Serializable breaker snapshot for the heartbeat.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerInfo {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub trips_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_ms: Option<i64>,
}

struct BreakerInner {
    consecutive_failures: u32,
    opened_at_ms: Option<i64>,
    trips_total: u64,
    failure_threshold: u32,
    cooldown_ms: i64,
}

/// Latch that suppresses all evaluations after too many consecutive
/// execution failures, then auto-resets after a cooldown.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_ms: i64) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                consecutive_failures: 0,
                opened_at_ms: None,
                trips_total: 0,
                failure_threshold: failure_threshold.max(1),
                cooldown_ms,
            }),
        }
    }

    /// Apply runtime-config changes without losing the failure streak.
    pub fn configure(&self, failure_threshold: u32, cooldown_ms: i64) {
        let mut inner = self.inner.lock();
        inner.failure_threshold = failure_threshold.max(1);
        inner.cooldown_ms = cooldown_ms;
    }

    /// Report an execution failure from the adapter.
    pub fn record_failure(&self, now_ms: i64) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        if inner.opened_at_ms.is_none() && inner.consecutive_failures >= inner.failure_threshold {
            inner.opened_at_ms = Some(now_ms);
            inner.trips_total += 1;
            warn!(
                consecutive_failures = inner.consecutive_failures,
                cooldown_ms = inner.cooldown_ms,
                "circuit breaker OPEN"
            );
        }
    }

    /// Report a successful execution; the failure streak ends.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
    }

    /// True while open. Auto-resets to CLOSED once the cooldown has fully
    /// elapsed.
    pub fn is_open(&self, now_ms: i64) -> bool {
        let mut inner = self.inner.lock();
        match inner.opened_at_ms {
            None => false,
            Some(opened_at) => {
                if now_ms - opened_at >= inner.cooldown_ms {
                    inner.opened_at_ms = None;
                    inner.consecutive_failures = 0;
                    info!("circuit breaker auto-reset to CLOSED");
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn info(&self, now_ms: i64) -> BreakerInfo {
        // is_open applies the auto-reset before we read.
        let open = self.is_open(now_ms);
        let inner = self.inner.lock();
        BreakerInfo {
            state: if open {
                BreakerState::Open
            } else {
                BreakerState::Closed
            },
            consecutive_failures: inner.consecutive_failures,
            trips_total: inner.trips_total,
            cooldown_remaining_ms: inner
                .opened_at_ms
                .map(|at| (inner.cooldown_ms - (now_ms - at)).max(0)),
        }
    }
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

/// Reason tags, exactly as they appear in heartbeat blocked counts.
pub const TAG_FRESHNESS: &str = "freshness";
pub const TAG_SKEW: &str = "skew";
pub const TAG_SLIPPAGE: &str = "slippage";
pub const TAG_PROFIT_VALIDITY: &str = "profitValidity";
pub const TAG_BREAKER_OPEN: &str = "breakerOpen";

pub struct SafetyGates {
    breaker: std::sync::Arc<CircuitBreaker>,
    blocked: RwLock<HashMap<String, u64>>,
}

impl SafetyGates {
    pub fn new(breaker: std::sync::Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            blocked: RwLock::new(HashMap::new()),
        }
    }

    /// Run all gates in order. `recompute_profit_pct` re-prices the legs
    /// from the current cache contents for the validity gate.
    pub fn check(
        &self,
        opp: &Opportunity,
        leg_a: &EffectivePrice,
        leg_b: &EffectivePrice,
        cfg: &RuntimeConfig,
        now_ms: i64,
        recompute_profit_pct: impl Fn() -> f64,
    ) -> Result<(), &'static str> {
        if let Err(tag) = self.run_gates(opp, leg_a, leg_b, cfg, now_ms, recompute_profit_pct) {
            *self.blocked.write().entry(tag.to_string()).or_insert(0) += 1;
            debug!(id = %opp.id, tag, "opportunity blocked");
            return Err(tag);
        }
        Ok(())
    }

    fn run_gates(
        &self,
        opp: &Opportunity,
        leg_a: &EffectivePrice,
        leg_b: &EffectivePrice,
        cfg: &RuntimeConfig,
        now_ms: i64,
        recompute_profit_pct: impl Fn() -> f64,
    ) -> Result<(), &'static str> {
        // 1. Freshness — strictly younger than the budget; a leg aged exactly
        //    maxPriceAgeMs is already too old.
        if leg_a.age_ms >= cfg.max_price_age_ms || leg_b.age_ms >= cfg.max_price_age_ms {
            return Err(TAG_FRESHNESS);
        }

        // 2. Skew between the two observations.
        if (leg_a.observed_at_ms - leg_b.observed_at_ms).abs() > cfg.max_skew_ms {
            return Err(TAG_SKEW);
        }

        // 3. Slippage — when a book is quoted, the half-spread from mid must
        //    stay inside the budget.
        for leg in [leg_a, leg_b] {
            if let (Some(bid), Some(ask)) = (leg.best_bid, leg.best_ask) {
                let mid = (bid + ask) / 2.0;
                if mid > 0.0 {
                    let half_spread_bps = ((ask - bid) / 2.0) / mid * 10_000.0;
                    if half_spread_bps > cfg.max_slippage_bps as f64 {
                        return Err(TAG_SLIPPAGE);
                    }
                }
            }
        }

        // 4. Profit validity — re-priced as of now, threshold inclusive. A
        //    leg that moved after evaluation fails here.
        if recompute_profit_pct() < cfg.min_profit_pct() {
            return Err(TAG_PROFIT_VALIDITY);
        }

        // 5. Breaker.
        if self.breaker.is_open(now_ms) {
            return Err(TAG_BREAKER_OPEN);
        }

        Ok(())
    }

    /// Blocked counts by tag, for the heartbeat.
    pub fn blocked_reasons(&self) -> HashMap<String, u64> {
        self.blocked.read().clone()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}
