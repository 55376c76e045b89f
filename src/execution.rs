// =============================================================================
// Execution Adapter — pluggable consumer of emitted opportunities
// =============================================================================
//
// The evaluator's job ends at emission; whether anything is traded is this
// layer's call. The shipped PaperExecutor simulates both legs and always
// fills, which exercises the full pipeline (breaker reports, KV logging)
// without touching a venue order API. A real adapter implements the same
// trait and inherits the plumbing.
//
// Every outcome is reported to the circuit breaker: consecutive failures
// open it and suppress further evaluations until the cooldown expires.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::evaluator::OpportunityQueue;
use crate::kv::KvStore;
use crate::safety::CircuitBreaker;
use crate::types::{now_ms, Opportunity};

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Serialize)]
pub enum ExecutionResult {
    /// Both legs placed (or simulated).
    Filled(String),
    /// The adapter declined the opportunity.
    Skipped(String),
    /// The attempt failed; counts toward the circuit breaker.
    Error(String),
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled(msg) => write!(f, "Filled({msg})"),
            Self::Skipped(reason) => write!(f, "Skipped({reason})"),
            Self::Error(err) => write!(f, "Error({err})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter trait + paper implementation
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, opportunity: &Opportunity) -> ExecutionResult;
}

/// Simulates fills locally; no request ever reaches a venue.
pub struct PaperExecutor;

#[async_trait]
impl ExecutionAdapter for PaperExecutor {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn execute(&self, opportunity: &Opportunity) -> ExecutionResult {
        let fill_id = Uuid::new_v4().to_string();
        let msg = format!(
            "paper fill {fill_id}: {} {} @ {:.1}c + {} {} @ {:.1}c, profit {:.2}% (fees {:.0}c)",
            opportunity.leg_a.venue,
            opportunity.leg_a.side,
            opportunity.leg_a.price_cents,
            opportunity.leg_b.venue,
            opportunity.leg_b.side,
            opportunity.leg_b.price_cents,
            opportunity.profit_pct,
            opportunity.fee_cents,
        );
        info!(id = %opportunity.id, "{}", msg);
        ExecutionResult::Filled(msg)
    }
}

// ---------------------------------------------------------------------------
// Router task
// ---------------------------------------------------------------------------

/// Serializable execution statistics for the heartbeat.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub adapter: &'static str,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Drains the opportunity queue into the adapter, reports outcomes to the
/// breaker, and appends every emitted opportunity to the KV log.
#[derive(Clone)]
pub struct ExecutionRouter {
    adapter_name: &'static str,
    executed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
}

impl ExecutionRouter {
    pub fn spawn(
        queue: Arc<OpportunityQueue>,
        adapter: Arc<dyn ExecutionAdapter>,
        breaker: Arc<CircuitBreaker>,
        kv: Option<KvStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let executed = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let skipped = Arc::new(AtomicU64::new(0));

        let router = Self {
            adapter_name: adapter.name(),
            executed: executed.clone(),
            failed: failed.clone(),
            skipped: skipped.clone(),
        };

        let mut task_shutdown = shutdown;
        tokio::spawn(async move {
            loop {
                let opportunity = tokio::select! {
                    _ = task_shutdown.changed() => {
                        if *task_shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                    opp = queue.pop() => opp,
                };

                let result = adapter.execute(&opportunity).await;
                match &result {
                    ExecutionResult::Filled(_) => {
                        breaker.record_success();
                        executed.fetch_add(1, Ordering::Relaxed);
                    }
                    ExecutionResult::Skipped(reason) => {
                        skipped.fetch_add(1, Ordering::Relaxed);
                        info!(id = %opportunity.id, reason = %reason, "opportunity skipped by adapter");
                    }
                    ExecutionResult::Error(err) => {
                        breaker.record_failure(now_ms());
                        failed.fetch_add(1, Ordering::Relaxed);
                        warn!(id = %opportunity.id, error = %err, "execution failed");
                    }
                }

                // The log is observability, not a ledger; a failed append
                // never retries the execution.
                if let Some(kv) = &kv {
                    if let Err(e) = kv.append_opportunity(&opportunity).await {
                        warn!(id = %opportunity.id, error = %e, "opportunity log append failed");
                    }
                }
            }
        });

        router
    }

    pub fn stats(&self) -> ExecutionStats {
        ExecutionStats {
            adapter: self.adapter_name,
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Opportunity, OpportunityLeg, Outcome, PriceSource, Venue};
    use chrono::Utc;
    use std::time::Duration;

    fn opp(id: &str) -> Opportunity {
        let leg = |venue, market: &str, side| OpportunityLeg {
            venue,
            market_id: market.to_string(),
            side,
            price_cents: 55.0,
            decimal_odds: None,
            observed_at_ms: now_ms(),
            age_ms: 10,
            source: PriceSource::Stream,
        };
        Opportunity {
            id: id.to_string(),
            event_key: "e1".to_string(),
            leg_a: leg(Venue::Kalshi, "m1", Outcome::Yes),
            leg_b: leg(Venue::Polymarket, "m2", Outcome::No),
            profit_abs: 0.05,
            profit_pct: 5.26,
            skew_ms: 10,
            flipped: false,
            fee_cents: 3.0,
            detected_at: Utc::now(),
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl ExecutionAdapter for AlwaysFails {
        fn name(&self) -> &'static str {
            "always-fails"
        }

        async fn execute(&self, _opportunity: &Opportunity) -> ExecutionResult {
            ExecutionResult::Error("venue rejected order".to_string())
        }
    }

    #[tokio::test]
    async fn paper_executor_fills() {
        let result = PaperExecutor.execute(&opp("o1")).await;
        assert!(matches!(result, ExecutionResult::Filled(_)));
    }

    #[tokio::test]
    async fn router_reports_successes_to_breaker() {
        let queue = Arc::new(OpportunityQueue::new(16));
        let breaker = Arc::new(CircuitBreaker::new(1, 60_000));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let router = ExecutionRouter::spawn(
            queue.clone(),
            Arc::new(PaperExecutor),
            breaker.clone(),
            None,
            shutdown_rx,
        );

        queue.push(opp("o1"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(router.stats().executed, 1);
        assert!(!breaker.is_open(now_ms()));
    }

    #[tokio::test]
    async fn consecutive_failures_open_the_breaker() {
        let queue = Arc::new(OpportunityQueue::new(16));
        let breaker = Arc::new(CircuitBreaker::new(5, 60_000));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let router = ExecutionRouter::spawn(
            queue.clone(),
            Arc::new(AlwaysFails),
            breaker.clone(),
            None,
            shutdown_rx,
        );

        for i in 0..5 {
            queue.push(opp(&format!("o{i}")));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(router.stats().failed, 5);
        assert!(breaker.is_open(now_ms()));
    }
}
