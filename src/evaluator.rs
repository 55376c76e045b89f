// =============================================================================
// Arbitrage Evaluator — re-prices event pairs on every relevant cache update
// =============================================================================
//
// The price cache's update listener forwards keys to a dispatcher task over a
// bounded channel (the cache write path never blocks; overflow drops the
// trigger and counts it — a later update re-triggers the same event). The
// dispatcher throttles per event, enumerates member pairs, prices both side
// assignments, and pushes gate-approved opportunities onto a bounded queue
// that drops the oldest entry on overflow.
//
// Money math is integer cents wherever it matters: combined cost is rounded
// UP to the next cent before the profit check, matching venue fee rounding.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tracing::info;

use crate::price_cache::{EffectivePrice, PriceCache};
use crate::registry::EventRegistry;
use crate::runtime_config::RuntimeConfig;
use crate::safety::SafetyGates;
use crate::types::{
    now_ms, Opportunity, OpportunityLeg, Outcome, PriceKey, TrackedEvent, Venue,
};

/// Capacity of the trigger channel from the cache listener.
const TRIGGER_CHANNEL_CAPACITY: usize = 4096;

/// Capacity of the emitted-opportunity queue.
const OPPORTUNITY_QUEUE_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Bounded opportunity queue (drop-oldest)
// ---------------------------------------------------------------------------

/// Bounded FIFO between the evaluator and the executor. When full, the
/// OLDEST opportunity is dropped: a fresh detection always beats a stale one.
pub struct OpportunityQueue {
    inner: Mutex<VecDeque<Opportunity>>,
    notify: Notify,
    capacity: usize,
    dropped_oldest: AtomicU64,
}

impl OpportunityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped_oldest: AtomicU64::new(0),
        }
    }

    pub fn push(&self, opp: Opportunity) {
        {
            let mut q = self.inner.lock();
            if q.len() == self.capacity {
                q.pop_front();
                self.dropped_oldest.fetch_add(1, Ordering::Relaxed);
            }
            q.push_back(opp);
        }
        self.notify.notify_one();
    }

    /// Await the next opportunity.
    pub async fn pop(&self) -> Opportunity {
        loop {
            if let Some(opp) = self.inner.lock().pop_front() {
                return opp;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<Opportunity> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn dropped_oldest(&self) -> u64 {
        self.dropped_oldest.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Evaluator handle
// ---------------------------------------------------------------------------

/// Serializable evaluator statistics for the heartbeat.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorStats {
    pub evaluations: u64,
    pub emitted: u64,
    pub dropped_triggers: u64,
    pub queue_dropped_oldest: u64,
    pub queue_depth: usize,
}

#[derive(Clone)]
pub struct Evaluator {
    update_tx: mpsc::Sender<PriceKey>,
    queue: Arc<OpportunityQueue>,
    evaluations: Arc<AtomicU64>,
    emitted: Arc<AtomicU64>,
    dropped_triggers: Arc<AtomicU64>,
}

impl Evaluator {
    pub fn spawn(
        cache: Arc<PriceCache>,
        registry: Arc<EventRegistry>,
        gates: Arc<SafetyGates>,
        config: Arc<RwLock<RuntimeConfig>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (update_tx, update_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        let queue = Arc::new(OpportunityQueue::new(OPPORTUNITY_QUEUE_CAPACITY));
        let evaluations = Arc::new(AtomicU64::new(0));
        let emitted = Arc::new(AtomicU64::new(0));

        let dispatcher = Dispatcher {
            cache,
            registry,
            gates,
            config,
            queue: queue.clone(),
            evaluations: evaluations.clone(),
            emitted: emitted.clone(),
            last_eval_ms: HashMap::new(),
            shutdown,
        };
        tokio::spawn(dispatcher.run(update_rx));

        Self {
            update_tx,
            queue,
            evaluations,
            emitted,
            dropped_triggers: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cache-listener entry point. O(1), never blocks the writer: a full
    /// channel drops the trigger, and the event re-triggers on its next
    /// update.
    pub fn on_price_update(&self, key: PriceKey) {
        if self.update_tx.try_send(key).is_err() {
            self.dropped_triggers.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn queue(&self) -> Arc<OpportunityQueue> {
        self.queue.clone()
    }

    pub fn stats(&self) -> EvaluatorStats {
        EvaluatorStats {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped_triggers: self.dropped_triggers.load(Ordering::Relaxed),
            queue_dropped_oldest: self.queue.dropped_oldest(),
            queue_depth: self.queue.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher task
// ---------------------------------------------------------------------------

struct Dispatcher {
    cache: Arc<PriceCache>,
    registry: Arc<EventRegistry>,
    gates: Arc<SafetyGates>,
    config: Arc<RwLock<RuntimeConfig>>,
    queue: Arc<OpportunityQueue>,
    evaluations: Arc<AtomicU64>,
    emitted: Arc<AtomicU64>,
    last_eval_ms: HashMap<String, i64>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    async fn run(mut self, mut update_rx: mpsc::Receiver<PriceKey>) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return;
                    }
                }
                key = update_rx.recv() => match key {
                    Some(key) => self.handle_update(&key),
                    None => return,
                },
            }
        }
    }

    fn handle_update(&mut self, key: &PriceKey) {
        let now = now_ms();
        let view = self.registry.load();

        // Throttle entries for events the registry no longer tracks (ended,
        // collected, or key rotated) are dead weight; drop them whenever the
        // map has outgrown the live view.
        if self.last_eval_ms.len() > view.events.len() {
            let live: HashSet<&str> = view.events.iter().map(|e| e.event_key.as_str()).collect();
            self.last_eval_ms.retain(|key, _| live.contains(key.as_str()));
        }

        let Some(event) = view.find_by_member(key.venue, &key.market_id) else {
            return;
        };

        // Per-event throttle: bursts coalesce, the newest prices win when
        // the window reopens.
        let cfg = self.config.read().clone();
        if let Some(&last) = self.last_eval_ms.get(&event.event_key) {
            if now - last < cfg.eval_throttle_ms {
                return;
            }
        }
        self.last_eval_ms.insert(event.event_key.clone(), now);
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let candidates = evaluate_event(&self.cache, event, &cfg, now);
        for candidate in candidates {
            // The validity gate re-prices from the cache at check time, so a
            // price that moved since evaluate_event genuinely blocks.
            let recompute = || live_profit_pct(&self.cache, event, &candidate.opp, &cfg, now_ms());
            if self
                .gates
                .check(&candidate.opp, &candidate.leg_a, &candidate.leg_b, &cfg, now, recompute)
                .is_ok()
            {
                info!(
                    id = %candidate.opp.id,
                    event_key = %candidate.opp.event_key,
                    profit_pct = candidate.opp.profit_pct,
                    skew_ms = candidate.opp.skew_ms,
                    flipped = candidate.opp.flipped,
                    "opportunity emitted"
                );
                self.registry.record_opportunity(&candidate.opp.event_key);
                self.emitted.fetch_add(1, Ordering::Relaxed);
                self.queue.push(candidate.opp);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// One gate-ready detection: the opportunity plus the leg inputs it was
/// priced from.
pub struct PricedCandidate {
    pub opp: Opportunity,
    pub leg_a: EffectivePrice,
    pub leg_b: EffectivePrice,
}

/// Price every member pair of `event` and return candidates clearing the
/// profit threshold, sorted by descending profit.
///
/// Side assignment: normally one venue's YES pairs with the other's NO; a
/// group annotated with opposing directions pairs YES with YES (and NO with
/// NO), because the venues already quote opposite framings of the same
/// question.
pub fn evaluate_event(
    cache: &PriceCache,
    event: &TrackedEvent,
    cfg: &RuntimeConfig,
    now_ms: i64,
) -> Vec<PricedCandidate> {
    let combos: [(Outcome, Outcome); 2] = if event.opposing_sides {
        [(Outcome::Yes, Outcome::Yes), (Outcome::No, Outcome::No)]
    } else {
        [(Outcome::Yes, Outcome::No), (Outcome::No, Outcome::Yes)]
    };

    let mut candidates = Vec::new();
    for i in 0..event.members.len() {
        for j in (i + 1)..event.members.len() {
            let a = &event.members[i];
            let b = &event.members[j];

            for (side_a, side_b) in combos {
                let Some(eff_a) =
                    cache.get_effective(a, side_a, cfg.max_price_age_ms, now_ms)
                else {
                    continue;
                };
                let Some(eff_b) =
                    cache.get_effective(b, side_b, cfg.max_price_age_ms, now_ms)
                else {
                    continue;
                };

                let cost_cents = ceil_cents(eff_a.price_cents + eff_b.price_cents);
                let profit_pct = profit_pct_for_cost(cost_cents);
                if profit_pct < cfg.min_profit_pct() {
                    continue;
                }

                let detected_at = Utc::now();
                let leg_a = make_leg(a.venue, &a.id, side_a, &eff_a);
                let leg_b = make_leg(b.venue, &b.id, side_b, &eff_b);
                let id = Opportunity::make_id(
                    &event.event_key,
                    &leg_a,
                    &leg_b,
                    detected_at.timestamp(),
                );
                let fee_cents =
                    ceil_cents(leg_fee_cents(a.venue, eff_a.price_cents)
                        + leg_fee_cents(b.venue, eff_b.price_cents));

                candidates.push(PricedCandidate {
                    opp: Opportunity {
                        id,
                        event_key: event.event_key.clone(),
                        leg_a,
                        leg_b,
                        profit_abs: (100.0 - cost_cents) / 100.0,
                        profit_pct,
                        skew_ms: (eff_a.observed_at_ms - eff_b.observed_at_ms).abs(),
                        flipped: event.opposing_sides,
                        fee_cents,
                        detected_at,
                    },
                    leg_a: eff_a,
                    leg_b: eff_b,
                });
            }
        }
    }

    candidates.sort_by(|x, y| {
        y.opp
            .profit_pct
            .partial_cmp(&x.opp.profit_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

/// Profit percentage for a combined cost in (already rounded-up) cents.
/// Cost at or above one dollar never profits.
fn profit_pct_for_cost(cost_cents: f64) -> f64 {
    if cost_cents >= 100.0 || cost_cents <= 0.0 {
        return 0.0;
    }
    (100.0 - cost_cents) / cost_cents * 100.0
}

/// Two-leg profit from raw leg costs.
pub fn pair_profit_pct(leg_a_cents: f64, leg_b_cents: f64) -> f64 {
    profit_pct_for_cost(ceil_cents(leg_a_cents + leg_b_cents))
}

/// Re-price an opportunity's legs from the cache as of `now_ms`. This is the
/// validity gate's input: a leg that moved (or vanished) after the original
/// evaluation changes the answer here, where the frozen candidate legs would
/// not.
pub fn live_profit_pct(
    cache: &PriceCache,
    event: &TrackedEvent,
    opp: &Opportunity,
    cfg: &RuntimeConfig,
    now_ms: i64,
) -> f64 {
    let fresh_cents = |leg: &OpportunityLeg| {
        event
            .members
            .iter()
            .find(|m| m.venue == leg.venue && m.id == leg.market_id)
            .and_then(|m| cache.get_effective(m, leg.side, cfg.max_price_age_ms, now_ms))
            .map(|eff| eff.price_cents)
    };
    match (fresh_cents(&opp.leg_a), fresh_cents(&opp.leg_b)) {
        (Some(a), Some(b)) => pair_profit_pct(a, b),
        // A leg with no price anymore cannot clear any threshold.
        _ => 0.0,
    }
}

/// Round up to the next whole cent (venue fees round against the taker).
fn ceil_cents(cents: f64) -> f64 {
    cents.ceil()
}

fn make_leg(venue: Venue, market_id: &str, side: Outcome, eff: &EffectivePrice) -> OpportunityLeg {
    OpportunityLeg {
        venue,
        market_id: market_id.to_string(),
        side,
        price_cents: eff.price_cents,
        decimal_odds: eff.decimal_odds,
        observed_at_ms: eff.observed_at_ms,
        age_ms: eff.age_ms,
        source: eff.source,
    }
}

/// Per-venue taker fee estimate for one leg, in cents per contract.
fn leg_fee_cents(venue: Venue, cost_cents: f64) -> f64 {
    let p = (cost_cents / 100.0).clamp(0.0, 1.0);
    match venue {
        // Fee schedule is 7% of p(1−p) per contract.
        Venue::Kalshi => 7.0 * p * (1.0 - p),
        // Flat 2% taker fee on notional.
        Venue::Polymarket | Venue::SxBet => cost_cents * 0.02,
    }
}
