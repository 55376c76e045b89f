// =============================================================================
// Price Cache — freshest known price per (venue, market, outcome)
// =============================================================================
//
// Single source of truth for live prices. Venue stream clients are the only
// writers; the evaluator and heartbeat are readers.
//
// Thread safety:
//   - The key space is split across fixed shards, each behind its own
//     parking_lot::RwLock, so concurrent venue writers rarely contend.
//   - Counters are lock-free atomics.
//   - Update listeners run synchronously after an accepted put and are
//     isolated with catch_unwind; a panicking listener never poisons the
//     write path.
//
// Ordering: within one key, points are applied in monotonic observedAt order.
// A put carrying an older observedAt than the stored point is dropped. An
// equal observedAt is accepted and re-fires listeners (repeated best-bid
// confirmations carry refined metadata).
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::types::{
    now_ms, round_implied, MarketKind, Outcome, PriceKey, PricePoint, PriceSource, PriceUpdate,
    Venue, VenueMarket,
};

/// Number of lock shards. Power of two so the hash folds cheaply.
const SHARD_COUNT: usize = 16;

/// Tolerated forward clock skew on inbound observations.
const MAX_FUTURE_SKEW_MS: i64 = 1_000;

type UpdateListener = Box<dyn Fn(&PriceUpdate) + Send + Sync>;

/// The price a caller should act on for one leg, with provenance and age.
#[derive(Debug, Clone)]
pub struct EffectivePrice {
    pub price_cents: f64,
    pub implied: f64,
    pub decimal_odds: Option<f64>,
    pub source: PriceSource,
    pub age_ms: i64,
    pub observed_at_ms: i64,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
}

/// Serializable cache statistics for the heartbeat.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub points_by_venue: HashMap<String, usize>,
    pub total_points: usize,
    pub accepted_updates: u64,
    pub dropped_stale: u64,
    pub dropped_malformed: u64,
    pub handler_panics: u64,
    /// Ages of the oldest and newest points, in milliseconds.
    pub oldest_age_ms: Option<i64>,
    pub newest_age_ms: Option<i64>,
}

pub struct PriceCache {
    shards: Vec<RwLock<HashMap<PriceKey, PricePoint>>>,
    listeners: RwLock<Vec<UpdateListener>>,
    accepted: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_malformed: AtomicU64,
    handler_panics: AtomicU64,
}

impl PriceCache {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            listeners: RwLock::new(Vec::new()),
            accepted: AtomicU64::new(0),
            dropped_stale: AtomicU64::new(0),
            dropped_malformed: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
        }
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Accept a normalized price update.
    ///
    /// Drops the update when it is malformed or strictly older than the
    /// stored point for its key. For prediction-venue keys an accepted put
    /// also derives the complementary outcome at `100 − price`, stamped with
    /// the same observedAt and source, unless a strictly fresher independent
    /// reading for the complement already exists. Sportsbook sides are two
    /// explicit legs and are never auto-complemented.
    pub fn put(&self, update: PriceUpdate) {
        if !self.validate(&update) {
            self.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let derive = update.key.venue.market_kind() == MarketKind::Prediction;
        if !self.store(&update) {
            return;
        }

        if derive {
            self.store(&complement_update(&update));
        }
    }

    /// Insert one point, honoring the monotonic-observed rule. Returns
    /// whether the point was accepted. Listeners fire on acceptance.
    fn store(&self, update: &PriceUpdate) -> bool {
        let shard = &self.shards[self.shard_index(&update.key)];
        {
            let mut map = shard.write();
            if let Some(existing) = map.get(&update.key) {
                if update.observed_at_ms < existing.observed_at_ms {
                    self.dropped_stale.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
            map.insert(update.key.clone(), PricePoint::from_update(update));
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.notify(update);
        true
    }

    /// Drop everything. Used only on shutdown.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }

    /// Remove all points for `market_id` on `venue` (venue unsubscribe).
    pub fn remove_market(&self, venue: Venue, market_id: &str) {
        for outcome in [Outcome::Yes, Outcome::No] {
            let key = PriceKey::new(venue, market_id, outcome);
            self.shards[self.shard_index(&key)].write().remove(&key);
        }
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub fn get(&self, key: &PriceKey) -> Option<PricePoint> {
        self.shards[self.shard_index(key)].read().get(key).cloned()
    }

    /// True iff the point is missing or strictly older than `max_age_ms`.
    pub fn is_stale(&self, key: &PriceKey, max_age_ms: i64, now_ms: i64) -> bool {
        match self.get(key) {
            Some(p) => p.age_ms(now_ms) > max_age_ms,
            None => true,
        }
    }

    /// Best actionable price for one outcome of `market`.
    ///
    /// Prefers a stream point no older than `max_age_ms`. When the stream
    /// point is missing or too old, falls back to the snapshot price embedded
    /// in the market listing (source = snapshot, treated as the venue's
    /// current resting quote). When neither fallback exists, returns the
    /// stale stream point with its true age so the freshness gate can reject
    /// the pair explicitly.
    pub fn get_effective(
        &self,
        market: &VenueMarket,
        outcome: Outcome,
        max_age_ms: i64,
        now_ms: i64,
    ) -> Option<EffectivePrice> {
        let key = PriceKey::new(market.venue, market.id.clone(), outcome);
        let stream = self.get(&key);

        if let Some(ref p) = stream {
            let age = p.age_ms(now_ms);
            if age <= max_age_ms {
                return Some(EffectivePrice {
                    price_cents: p.price_cents,
                    implied: p.implied,
                    decimal_odds: p.decimal_odds,
                    source: p.source,
                    age_ms: age,
                    observed_at_ms: p.observed_at_ms,
                    best_bid: p.best_bid,
                    best_ask: p.best_ask,
                });
            }
        }

        if let Some(price_cents) = market.snapshot_price_cents(outcome) {
            return Some(EffectivePrice {
                price_cents,
                implied: round_implied(price_cents / 100.0),
                decimal_odds: market.snapshot_decimal_odds(outcome),
                source: PriceSource::Snapshot,
                age_ms: 0,
                observed_at_ms: now_ms,
                best_bid: None,
                best_ask: None,
            });
        }

        stream.map(|p| EffectivePrice {
            price_cents: p.price_cents,
            implied: p.implied,
            decimal_odds: p.decimal_odds,
            source: p.source,
            age_ms: p.age_ms(now_ms),
            observed_at_ms: p.observed_at_ms,
            best_bid: p.best_bid,
            best_ask: p.best_ask,
        })
    }

    /// Build serializable statistics for the heartbeat.
    pub fn stats(&self) -> CacheStats {
        let now = now_ms();
        let mut points_by_venue: HashMap<String, usize> = HashMap::new();
        let mut total = 0usize;
        let mut oldest: Option<i64> = None;
        let mut newest: Option<i64> = None;

        for shard in &self.shards {
            let map = shard.read();
            total += map.len();
            for (key, point) in map.iter() {
                *points_by_venue
                    .entry(key.venue.as_str().to_string())
                    .or_insert(0) += 1;
                let age = point.age_ms(now);
                oldest = Some(oldest.map_or(age, |o| o.max(age)));
                newest = Some(newest.map_or(age, |n| n.min(age)));
            }
        }

        CacheStats {
            points_by_venue,
            total_points: total,
            accepted_updates: self.accepted.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            oldest_age_ms: oldest,
            newest_age_ms: newest,
        }
    }

    // ── Listeners ───────────────────────────────────────────────────────

    /// Register a listener called after every accepted put. Listeners run
    /// synchronously on the writer's task and must be O(1); hand anything
    /// heavier to a channel.
    pub fn subscribe(&self, listener: impl Fn(&PriceUpdate) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    fn notify(&self, update: &PriceUpdate) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(update))).is_err() {
                let n = self.handler_panics.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(key = %update.key, panics = n, "price update listener panicked");
            }
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn shard_index(&self, key: &PriceKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % SHARD_COUNT
    }

    fn validate(&self, update: &PriceUpdate) -> bool {
        if !update.price_cents.is_finite()
            || !(0.0..=100.0).contains(&update.price_cents)
            || !update.implied.is_finite()
            || !(0.0..=1.0).contains(&update.implied)
        {
            return false;
        }
        if update.observed_at_ms > now_ms() + MAX_FUTURE_SKEW_MS {
            return false;
        }
        if let Some(odds) = update.decimal_odds {
            if !odds.is_finite() || odds < 1.01 {
                return false;
            }
        }
        true
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the complementary-outcome update for a prediction-market put.
fn complement_update(update: &PriceUpdate) -> PriceUpdate {
    let comp_key = PriceKey::new(
        update.key.venue,
        update.key.market_id.clone(),
        update.key.outcome.complement(),
    );
    // Mirror the book: the complement's bid is what the original ask leaves.
    let best_bid = update.best_ask.map(|a| 100.0 - a);
    let best_ask = update.best_bid.map(|b| 100.0 - b);
    PriceUpdate {
        key: comp_key,
        price_cents: 100.0 - update.price_cents,
        implied: round_implied(1.0 - update.implied),
        source: update.source,
        observed_at_ms: update.observed_at_ms,
        best_bid,
        best_ask,
        spread: update.spread,
        decimal_odds: None,
    }
}

impl std::fmt::Debug for PriceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceCache")
            .field("accepted", &self.accepted.load(Ordering::Relaxed))
            .field(
                "dropped_stale",
                &self.dropped_stale.load(Ordering::Relaxed),
            )
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketKind;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn update(venue: Venue, market: &str, outcome: Outcome, cents: f64, at: i64) -> PriceUpdate {
        PriceUpdate {
            key: PriceKey::new(venue, market, outcome),
            price_cents: cents,
            implied: round_implied(cents / 100.0),
            source: PriceSource::Stream,
            observed_at_ms: at,
            best_bid: None,
            best_ask: None,
            spread: None,
            decimal_odds: None,
        }
    }

    fn market(venue: Venue, id: &str, yes: Option<f64>, no: Option<f64>) -> VenueMarket {
        VenueMarket {
            id: id.to_string(),
            venue,
            kind: venue.market_kind(),
            title: "test market".to_string(),
            home_team: None,
            away_team: None,
            sport: None,
            start_time: None,
            close_time: Utc::now() + chrono::Duration::hours(4),
            yes_price_cents: yes,
            no_price_cents: no,
            yes_decimal_odds: None,
            no_decimal_odds: None,
            liquidity_usd: 0.0,
            volume_usd: 0.0,
        }
    }

    #[test]
    fn older_put_is_dropped() {
        let cache = PriceCache::new();
        let t = now_ms();
        cache.put(update(Venue::Kalshi, "m1", Outcome::Yes, 55.0, t));
        cache.put(update(Venue::Kalshi, "m1", Outcome::Yes, 60.0, t - 500));

        let point = cache
            .get(&PriceKey::new(Venue::Kalshi, "m1", Outcome::Yes))
            .unwrap();
        assert_eq!(point.price_cents, 55.0);
        assert_eq!(cache.stats().dropped_stale, 1);
    }

    #[test]
    fn equal_observed_at_is_accepted_and_refires() {
        let cache = PriceCache::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        cache.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let t = now_ms();
        // SxBet: no complement derivation, so each put fires exactly once.
        let mut u = update(Venue::SxBet, "m1", Outcome::Yes, 55.0, t);
        u.decimal_odds = Some(1.8);
        cache.put(u.clone());
        cache.put(u);

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        let point = cache
            .get(&PriceKey::new(Venue::SxBet, "m1", Outcome::Yes))
            .unwrap();
        assert_eq!(point.price_cents, 55.0);
    }

    #[test]
    fn prediction_put_derives_complement() {
        let cache = PriceCache::new();
        let t = now_ms();
        cache.put(update(Venue::Polymarket, "m1", Outcome::Yes, 60.0, t));

        let no = cache
            .get(&PriceKey::new(Venue::Polymarket, "m1", Outcome::No))
            .unwrap();
        assert_eq!(no.price_cents, 40.0);
        assert_eq!(no.observed_at_ms, t);
        assert_eq!(no.source, PriceSource::Stream);
        assert_eq!(no.implied, 0.4);
    }

    #[test]
    fn complement_never_overwrites_fresher_independent_reading() {
        let cache = PriceCache::new();
        let t = now_ms();
        // Independent NO reading arrives first, slightly in the future of the
        // YES update that would derive its complement.
        cache.put(update(Venue::Kalshi, "m1", Outcome::No, 42.0, t + 100));
        cache.put(update(Venue::Kalshi, "m1", Outcome::Yes, 60.0, t));

        let no = cache
            .get(&PriceKey::new(Venue::Kalshi, "m1", Outcome::No))
            .unwrap();
        assert_eq!(no.price_cents, 42.0);
    }

    #[test]
    fn sportsbook_put_does_not_complement() {
        let cache = PriceCache::new();
        let mut u = update(Venue::SxBet, "m1", Outcome::Yes, 55.0, now_ms());
        u.decimal_odds = Some(1.82);
        cache.put(u);

        assert!(cache
            .get(&PriceKey::new(Venue::SxBet, "m1", Outcome::No))
            .is_none());
    }

    #[test]
    fn malformed_updates_are_counted_and_dropped() {
        let cache = PriceCache::new();
        cache.put(update(Venue::Kalshi, "m1", Outcome::Yes, f64::NAN, now_ms()));
        cache.put(update(Venue::Kalshi, "m1", Outcome::Yes, 140.0, now_ms()));

        assert!(cache
            .get(&PriceKey::new(Venue::Kalshi, "m1", Outcome::Yes))
            .is_none());
        assert_eq!(cache.stats().dropped_malformed, 2);
    }

    #[test]
    fn get_effective_prefers_fresh_stream() {
        let cache = PriceCache::new();
        let now = now_ms();
        cache.put(update(Venue::Kalshi, "m1", Outcome::Yes, 55.0, now - 100));

        let m = market(Venue::Kalshi, "m1", Some(50.0), Some(50.0));
        let eff = cache.get_effective(&m, Outcome::Yes, 2_000, now).unwrap();
        assert_eq!(eff.source, PriceSource::Stream);
        assert_eq!(eff.price_cents, 55.0);
        assert_eq!(eff.age_ms, 100);
    }

    #[test]
    fn get_effective_falls_back_to_snapshot_when_stream_stale() {
        let cache = PriceCache::new();
        let now = now_ms();
        cache.put(update(Venue::Kalshi, "m1", Outcome::Yes, 55.0, now - 5_000));

        let m = market(Venue::Kalshi, "m1", Some(52.0), Some(48.0));
        let eff = cache.get_effective(&m, Outcome::Yes, 2_000, now).unwrap();
        assert_eq!(eff.source, PriceSource::Snapshot);
        assert_eq!(eff.price_cents, 52.0);
        assert_eq!(eff.age_ms, 0);
    }

    #[test]
    fn get_effective_returns_stale_stream_when_no_snapshot() {
        let cache = PriceCache::new();
        let now = now_ms();
        cache.put(update(Venue::Kalshi, "m1", Outcome::Yes, 55.0, now - 5_000));

        let m = market(Venue::Kalshi, "m1", None, None);
        let eff = cache.get_effective(&m, Outcome::Yes, 2_000, now).unwrap();
        assert_eq!(eff.source, PriceSource::Stream);
        assert_eq!(eff.age_ms, 5_000);
    }

    #[test]
    fn is_stale_boundary_is_strictly_greater() {
        let cache = PriceCache::new();
        let now = now_ms();
        cache.put(update(Venue::Kalshi, "m1", Outcome::Yes, 55.0, now - 2_000));

        let key = PriceKey::new(Venue::Kalshi, "m1", Outcome::Yes);
        assert!(!cache.is_stale(&key, 2_000, now));
        assert!(cache.is_stale(&key, 1_999, now));
        assert!(cache.is_stale(&PriceKey::new(Venue::Kalshi, "missing", Outcome::Yes), 2_000, now));
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let cache = PriceCache::new();
        cache.subscribe(|_| panic!("boom"));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        cache.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut u = update(Venue::SxBet, "m1", Outcome::Yes, 55.0, now_ms());
        u.decimal_odds = Some(1.9);
        cache.put(u);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().handler_panics, 1);
        assert!(cache
            .get(&PriceKey::new(Venue::SxBet, "m1", Outcome::Yes))
            .is_some());
    }

    #[test]
    fn clear_empties_all_shards() {
        let cache = PriceCache::new();
        for i in 0..50 {
            cache.put(update(
                Venue::Kalshi,
                &format!("m{i}"),
                Outcome::Yes,
                50.0,
                now_ms(),
            ));
        }
        assert!(cache.stats().total_points > 0);
        cache.clear();
        assert_eq!(cache.stats().total_points, 0);
    }

    #[test]
    fn venue_kind_mapping() {
        assert_eq!(Venue::Kalshi.market_kind(), MarketKind::Prediction);
        assert_eq!(Venue::Polymarket.market_kind(), MarketKind::Prediction);
        assert_eq!(Venue::SxBet.market_kind(), MarketKind::Sportsbook);
    }
}
