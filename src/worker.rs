// =============================================================================
// Worker — owns the data plane and drives the main loop
// =============================================================================
//
// The single source of truth for the whole process. The worker owns the price
// cache, the event registry, the safety gates, and (while enabled) the active
// pipeline: three venue stream clients, the subscription manager, the
// evaluator dispatcher, and the execution router.
//
// Main loop, once per second:
//   1. poll the runtime config object from the KV;
//   2. start or stop the pipeline when `liveArbEnabled` toggles;
//   3. while enabled, refresh the market snapshot every refreshIntervalMs
//      (discovery → matcher → registry swap).
//
// A refresh may be slow; the heartbeat loop runs independently and reports
// `refreshInProgress` while it does. A failed refresh keeps the previous
// registry and is logged once per failure streak.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::discovery::DiscoveryClient;
use crate::evaluator::Evaluator;
use crate::execution::{ExecutionRouter, PaperExecutor};
use crate::heartbeat::{WorkerHeartbeat, HEARTBEAT_SCHEMA_VERSION};
use crate::kv::KvStore;
use crate::matcher::{match_markets, MatcherConfig};
use crate::price_cache::PriceCache;
use crate::registry::EventRegistry;
use crate::runtime_config::RuntimeConfig;
use crate::safety::{CircuitBreaker, SafetyGates};
use crate::subscriptions::SubscriptionManager;
use crate::types::{now_ms, WorkerState};
use crate::venues::{kalshi::KalshiProtocol, polymarket::PolymarketProtocol, sxbet::SxBetProtocol};
use crate::venues::{StreamClient, VenueProtocol};

/// Main-loop cadence (config poll + refresh-due check).
const MAIN_LOOP_TICK: Duration = Duration::from_secs(1);

/// Everything that only exists while `liveArbEnabled` is on.
struct Pipeline {
    clients: Vec<StreamClient>,
    evaluator: Evaluator,
    subscriptions: SubscriptionManager,
    router: ExecutionRouter,
    stop_tx: watch::Sender<bool>,
}

pub struct Worker {
    pub cache: Arc<PriceCache>,
    pub registry: Arc<EventRegistry>,
    pub config: Arc<RwLock<RuntimeConfig>>,
    pub breaker: Arc<CircuitBreaker>,
    pub gates: Arc<SafetyGates>,
    kv: Option<KvStore>,
    discovery: DiscoveryClient,
    /// The cache's update listener forwards through this slot, so pipeline
    /// restarts swap the evaluator without re-registering listeners.
    evaluator_slot: Arc<RwLock<Option<Evaluator>>>,
    pipeline: RwLock<Option<Pipeline>>,
    state: RwLock<WorkerState>,
    last_refresh_at: RwLock<Option<DateTime<Utc>>>,
    last_refresh_attempt: RwLock<Option<std::time::Instant>>,
    refresh_in_progress: AtomicBool,
    refresh_failure_streak: AtomicU64,
    start_time: std::time::Instant,
}

impl Worker {
    pub fn new(
        initial_config: RuntimeConfig,
        kv: Option<KvStore>,
        discovery: DiscoveryClient,
    ) -> Arc<Self> {
        let cache = Arc::new(PriceCache::new());
        let breaker = Arc::new(CircuitBreaker::new(
            initial_config.breaker_failure_threshold,
            initial_config.breaker_cooldown_ms,
        ));
        let gates = Arc::new(SafetyGates::new(breaker.clone()));
        let evaluator_slot: Arc<RwLock<Option<Evaluator>>> = Arc::new(RwLock::new(None));

        // Registered once for the process lifetime; O(1) per update.
        let slot = evaluator_slot.clone();
        cache.subscribe(move |update| {
            if let Some(evaluator) = slot.read().as_ref() {
                evaluator.on_price_update(update.key.clone());
            }
        });

        Arc::new(Self {
            cache,
            registry: Arc::new(EventRegistry::new()),
            config: Arc::new(RwLock::new(initial_config)),
            breaker,
            gates,
            kv,
            discovery,
            evaluator_slot,
            pipeline: RwLock::new(None),
            state: RwLock::new(WorkerState::Starting),
            last_refresh_at: RwLock::new(None),
            last_refresh_attempt: RwLock::new(None),
            refresh_in_progress: AtomicBool::new(false),
            refresh_failure_streak: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        })
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    pub fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    // ── Main loop ───────────────────────────────────────────────────────

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(MAIN_LOOP_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            self.poll_config().await;

            let enabled = self.config.read().live_arb_enabled;
            if enabled && self.pipeline.read().is_none() {
                self.start_pipeline();
            } else if !enabled && self.pipeline.read().is_some() {
                self.stop_pipeline();
            }
            self.set_state(if enabled {
                WorkerState::Running
            } else {
                WorkerState::Idle
            });

            if enabled && self.refresh_due() {
                self.refresh_snapshot().await;
            }
        }

        self.stop_pipeline();
        self.cache.clear();
    }

    /// Pull the controller's config object; absence of the key means
    /// defaults, a read failure keeps the current config.
    async fn poll_config(&self) {
        let Some(kv) = &self.kv else {
            return;
        };
        match kv.read_runtime_config().await {
            Ok(Some(fresh)) => {
                let changed = {
                    let current = self.config.read();
                    *current != fresh
                };
                if changed {
                    info!(
                        live_arb_enabled = fresh.live_arb_enabled,
                        min_profit_bps = fresh.min_profit_bps,
                        "runtime config updated from KV"
                    );
                    self.breaker
                        .configure(fresh.breaker_failure_threshold, fresh.breaker_cooldown_ms);
                    *self.config.write() = fresh;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "runtime config poll failed — keeping current config");
            }
        }
    }

    // ── Pipeline lifecycle ──────────────────────────────────────────────

    fn start_pipeline(&self) {
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut clients = Vec::with_capacity(3);
        clients.push(self.client_for(KalshiProtocol::from_env().map(|p| {
            Arc::new(p) as Arc<dyn VenueProtocol>
        }), crate::types::Venue::Kalshi, &stop_rx));
        clients.push(self.client_for(PolymarketProtocol::from_env().map(|p| {
            Arc::new(p) as Arc<dyn VenueProtocol>
        }), crate::types::Venue::Polymarket, &stop_rx));
        clients.push(self.client_for(SxBetProtocol::from_env().map(|p| {
            Arc::new(p) as Arc<dyn VenueProtocol>
        }), crate::types::Venue::SxBet, &stop_rx));

        for client in &clients {
            client.connect();
        }

        let evaluator = Evaluator::spawn(
            self.cache.clone(),
            self.registry.clone(),
            self.gates.clone(),
            self.config.clone(),
            stop_rx.clone(),
        );
        *self.evaluator_slot.write() = Some(evaluator.clone());

        let subscriptions = SubscriptionManager::spawn(
            self.registry.clone(),
            clients.clone(),
            self.config.clone(),
            stop_rx.clone(),
        );

        let router = ExecutionRouter::spawn(
            evaluator.queue(),
            Arc::new(PaperExecutor),
            self.breaker.clone(),
            self.kv.clone(),
            stop_rx,
        );

        let enabled_venues: Vec<&str> = clients
            .iter()
            .filter(|c| !c.is_disabled())
            .map(|c| c.venue().as_str())
            .collect();
        info!(venues = ?enabled_venues, "pipeline started");

        *self.pipeline.write() = Some(Pipeline {
            clients,
            evaluator,
            subscriptions,
            router,
            stop_tx,
        });
    }

    fn client_for(
        &self,
        protocol: Option<Arc<dyn VenueProtocol>>,
        venue: crate::types::Venue,
        stop_rx: &watch::Receiver<bool>,
    ) -> StreamClient {
        match protocol {
            Some(protocol) => StreamClient::spawn(protocol, self.cache.clone(), stop_rx.clone()),
            None => {
                info!(venue = %venue, "credentials absent — venue disabled");
                StreamClient::disabled(venue)
            }
        }
    }

    fn stop_pipeline(&self) {
        let Some(pipeline) = self.pipeline.write().take() else {
            return;
        };
        *self.evaluator_slot.write() = None;
        for client in &pipeline.clients {
            client.disconnect();
        }
        let _ = pipeline.stop_tx.send(true);
        info!("pipeline stopped");
    }

    // ── Snapshot refresh ────────────────────────────────────────────────

    fn refresh_due(&self) -> bool {
        let interval_ms = self.config.read().refresh_interval_ms;
        match *self.last_refresh_attempt.read() {
            None => true,
            Some(at) => at.elapsed() >= Duration::from_millis(interval_ms),
        }
    }

    pub async fn refresh_snapshot(&self) {
        *self.last_refresh_attempt.write() = Some(std::time::Instant::now());
        self.refresh_in_progress.store(true, Ordering::Release);
        let _guard = RefreshGuard(&self.refresh_in_progress);

        let cfg = self.config.read().clone();
        match self.discovery.fetch_snapshot().await {
            Ok(snapshot) => {
                let now = Utc::now();
                let matched = if cfg.rule_based_matcher_enabled {
                    let matcher_cfg = MatcherConfig {
                        time_tolerance_mins: cfg.match_time_tolerance_mins,
                        min_quality: cfg.min_match_quality,
                        sports_only: cfg.sports_only,
                    };
                    match_markets(&snapshot.markets, now, &matcher_cfg)
                } else {
                    Vec::new()
                };

                let diff = self.registry.refresh(matched, now);
                *self.last_refresh_at.write() = Some(now);
                self.refresh_failure_streak.store(0, Ordering::Relaxed);
                info!(
                    markets = snapshot.markets.len(),
                    tracked = self.registry.stats().tracked_events,
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    "snapshot refreshed"
                );
            }
            Err(e) => {
                // Keep the previous registry; log once per failure streak.
                let streak = self.refresh_failure_streak.fetch_add(1, Ordering::Relaxed);
                if streak == 0 {
                    warn!(error = %e, "snapshot refresh failed — keeping previous registry");
                }
            }
        }
    }

    // ── Heartbeat snapshot ──────────────────────────────────────────────

    /// Assemble the full heartbeat record from in-memory stats. Pure reads;
    /// safe to call from the heartbeat loop at any time.
    pub fn build_heartbeat(
        &self,
        tick_count: u64,
        state_override: Option<WorkerState>,
        shutdown_reason: Option<String>,
    ) -> WorkerHeartbeat {
        let pipeline = self.pipeline.read();

        let platforms: HashMap<_, _> = pipeline
            .as_ref()
            .map(|p| {
                p.clients
                    .iter()
                    .map(|c| (c.venue().as_str().to_string(), c.status()))
                    .collect()
            })
            .unwrap_or_default();

        WorkerHeartbeat {
            schema_version: HEARTBEAT_SCHEMA_VERSION,
            updated_at: Utc::now(),
            state: state_override.unwrap_or_else(|| self.state()),
            tick_count,
            uptime_secs: self.start_time.elapsed().as_secs(),
            platforms,
            price_cache: self.cache.stats(),
            registry: self.registry.stats(),
            circuit_breaker: self.breaker.info(now_ms()),
            blocked_reasons: self.gates.blocked_reasons(),
            evaluator: pipeline.as_ref().map(|p| p.evaluator.stats()),
            execution: pipeline.as_ref().map(|p| p.router.stats()),
            subscriptions: pipeline.as_ref().map(|p| p.subscriptions.stats()),
            last_refresh_at: *self.last_refresh_at.read(),
            refresh_in_progress: self.refresh_in_progress.load(Ordering::Acquire),
            shutdown_reason,
        }
    }
}

/// Clears `refreshInProgress` on every exit path from a refresh.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> Arc<Worker> {
        Worker::new(RuntimeConfig::default(), None, DiscoveryClient::from_env())
    }

    #[tokio::test]
    async fn starts_in_starting_state() {
        let w = worker();
        assert_eq!(w.state(), WorkerState::Starting);
        let hb = w.build_heartbeat(1, None, None);
        assert_eq!(hb.state, WorkerState::Starting);
        assert_eq!(hb.tick_count, 1);
        assert!(hb.platforms.is_empty());
        assert!(hb.evaluator.is_none());
    }

    #[tokio::test]
    async fn pipeline_toggles_with_enablement() {
        let w = worker();
        assert!(w.pipeline.read().is_none());

        w.start_pipeline();
        assert!(w.pipeline.read().is_some());
        assert!(w.evaluator_slot.read().is_some());

        let hb = w.build_heartbeat(2, None, None);
        assert_eq!(hb.platforms.len(), 3);
        assert!(hb.evaluator.is_some());

        w.stop_pipeline();
        assert!(w.pipeline.read().is_none());
        assert!(w.evaluator_slot.read().is_none());
    }

    #[tokio::test]
    async fn refresh_with_no_configured_venues_sets_timestamps() {
        let w = worker();
        assert!(w.last_refresh_at.read().is_none());
        assert!(w.refresh_due());

        w.refresh_snapshot().await;

        assert!(w.last_refresh_at.read().is_some());
        assert!(!w.refresh_in_progress.load(Ordering::Acquire));
        assert!(!w.refresh_due());
    }

    #[tokio::test]
    async fn heartbeat_reflects_override_and_reason() {
        let w = worker();
        let hb = w.build_heartbeat(
            9,
            Some(WorkerState::Stopping),
            Some("SIGTERM".to_string()),
        );
        assert_eq!(hb.state, WorkerState::Stopping);
        assert_eq!(hb.shutdown_reason.as_deref(), Some("SIGTERM"));
    }
}
