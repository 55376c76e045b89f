// =============================================================================
// Subscription Manager — reconciles tracked events onto venue streams
// =============================================================================
//
// Desired state comes from the registry: the member market ids of live and
// imminent events, LIVE first, capped per venue. Actual state is each stream
// client's subscription set. A reconcile pass unsubscribes the surplus
// before subscribing the missing ids, so venue-side capacity frees up first.
//
// Triggers (registry diffs, reconnects, config changes, the periodic tick)
// are debounced: a pass runs only after the quiet period elapses, and
// triggers arriving meanwhile merge their reason tags and defer it.
//
// A venue whose client is not CONNECTED is skipped; its client's next
// CONNECTED transition fires a new trigger, so nothing is lost.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep_until;
use tracing::{debug, info};

use crate::registry::{EventRegistry, RegistryView};
use crate::runtime_config::RuntimeConfig;
use crate::types::{EventStatus, Venue};
use crate::venues::{ConnectionState, StreamClient};

/// Quiet period before a reconcile pass runs.
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Cadence of the unconditional periodic trigger.
const PERIODIC_TRIGGER: Duration = Duration::from_secs(5);

/// At most this many merged reason tags are retained per pass.
const MAX_REASONS: usize = 5;

/// Why a reconcile pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileReason {
    Startup,
    RegistryChanged,
    Reconnected,
    ConfigChanged,
    Periodic,
}

impl ReconcileReason {
    fn tag(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::RegistryChanged => "registry-changed",
            Self::Reconnected => "reconnected",
            Self::ConfigChanged => "config-changed",
            Self::Periodic => "periodic",
        }
    }
}

/// Serializable reconciliation diagnostics for the heartbeat.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStats {
    pub passes: u64,
    pub last_reasons: Vec<String>,
    pub subscribed_by_venue: HashMap<String, usize>,
}

/// Handle to the reconciler task.
#[derive(Clone)]
pub struct SubscriptionManager {
    trigger_tx: mpsc::UnboundedSender<ReconcileReason>,
    stats: Arc<RwLock<SubscriptionStats>>,
}

impl SubscriptionManager {
    /// Spawn the reconciler. Wires itself to registry diffs and to every
    /// client's CONNECTED transitions.
    pub fn spawn(
        registry: Arc<EventRegistry>,
        clients: Vec<StreamClient>,
        config: Arc<RwLock<RuntimeConfig>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(RwLock::new(SubscriptionStats::default()));

        // Registry diffs request reconciliation.
        let registry_trigger = trigger_tx.clone();
        registry.subscribe(move |_diff| {
            let _ = registry_trigger.send(ReconcileReason::RegistryChanged);
        });

        // A client coming (back) to CONNECTED re-enqueues a pass so skipped
        // venues converge.
        for client in &clients {
            let mut state_rx = client.state_watch();
            let reconnect_trigger = trigger_tx.clone();
            let mut client_shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            if *state_rx.borrow() == ConnectionState::Connected
                                && reconnect_trigger.send(ReconcileReason::Reconnected).is_err()
                            {
                                return;
                            }
                        }
                        _ = client_shutdown.changed() => {
                            if *client_shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        let runner = Runner {
            registry,
            clients,
            config,
            stats: stats.clone(),
            shutdown,
        };
        tokio::spawn(runner.run(trigger_rx));

        let manager = Self { trigger_tx, stats };
        manager.request(ReconcileReason::Startup);
        manager
    }

    /// Request a reconcile pass (debounced).
    pub fn request(&self, reason: ReconcileReason) {
        let _ = self.trigger_tx.send(reason);
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.stats.read().clone()
    }
}

struct Runner {
    registry: Arc<EventRegistry>,
    clients: Vec<StreamClient>,
    config: Arc<RwLock<RuntimeConfig>>,
    stats: Arc<RwLock<SubscriptionStats>>,
    shutdown: watch::Receiver<bool>,
}

impl Runner {
    async fn run(mut self, mut trigger_rx: mpsc::UnboundedReceiver<ReconcileReason>) {
        let mut periodic = tokio::time::interval(PERIODIC_TRIGGER);
        periodic.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            // Wait for the first trigger.
            let first = tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() { return; }
                    continue;
                }
                _ = periodic.tick() => ReconcileReason::Periodic,
                reason = trigger_rx.recv() => match reason {
                    Some(r) => r,
                    None => return,
                },
            };

            // Debounce: merge reasons, defer while triggers keep arriving.
            let mut reasons: Vec<ReconcileReason> = vec![first];
            let mut deadline = tokio::time::Instant::now() + DEBOUNCE;
            loop {
                tokio::select! {
                    _ = self.shutdown.changed() => {
                        if *self.shutdown.borrow() { return; }
                    }
                    _ = sleep_until(deadline) => break,
                    reason = trigger_rx.recv() => match reason {
                        Some(r) => {
                            if reasons.len() < MAX_REASONS && !reasons.contains(&r) {
                                reasons.push(r);
                            }
                            deadline = tokio::time::Instant::now() + DEBOUNCE;
                        }
                        None => return,
                    },
                }
            }

            self.reconcile(&reasons);
        }
    }

    fn reconcile(&self, reasons: &[ReconcileReason]) {
        let view = self.registry.load();
        let cfg = self.config.read().clone();
        let desired = compute_desired(&view, &cfg);

        let mut subscribed_by_venue = HashMap::new();
        for client in &self.clients {
            let venue = client.venue();
            let want: HashSet<String> = desired
                .get(&venue)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect();

            // Only a CONNECTED client can act; its next CONNECTED transition
            // re-triggers us for anything skipped here.
            if client.state() != ConnectionState::Connected {
                debug!(venue = %venue, state = %client.state(), "reconcile skipped — not connected");
                continue;
            }

            let current = client.subscribed_ids();
            let (to_remove, to_add) = diff_sets(&current, &want);

            // Unsubscribes first: free venue-side capacity before adding.
            if !to_remove.is_empty() {
                client.unsubscribe_markets(&to_remove);
            }
            if !to_add.is_empty() {
                client.subscribe_markets(&to_add);
            }
            if !to_remove.is_empty() || !to_add.is_empty() {
                info!(
                    venue = %venue,
                    added = to_add.len(),
                    removed = to_remove.len(),
                    reasons = ?reasons.iter().map(|r| r.tag()).collect::<Vec<_>>(),
                    "subscriptions reconciled"
                );
            }
            subscribed_by_venue.insert(venue.as_str().to_string(), client.subscribed_ids().len());
        }

        let mut stats = self.stats.write();
        stats.passes += 1;
        stats.last_reasons = reasons.iter().map(|r| r.tag().to_string()).collect();
        stats.subscribed_by_venue = subscribed_by_venue;
    }
}

/// Desired market ids per venue: LIVE events first, then by nearest start
/// time, capped at `max_subscriptions_per_venue`.
pub fn compute_desired(
    view: &RegistryView,
    cfg: &RuntimeConfig,
) -> HashMap<Venue, Vec<String>> {
    let mut events: Vec<_> = view
        .events
        .iter()
        .filter(|e| match e.status {
            EventStatus::Ended => false,
            EventStatus::Live => true,
            EventStatus::Pre => !cfg.live_events_only,
        })
        .collect();

    events.sort_by(|a, b| {
        let live_a = a.status == EventStatus::Live;
        let live_b = b.status == EventStatus::Live;
        live_b.cmp(&live_a).then_with(|| {
            let start_a = a.members.iter().filter_map(|m| m.start_time).min();
            let start_b = b.members.iter().filter_map(|m| m.start_time).min();
            match (start_a, start_b) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.event_key.cmp(&b.event_key),
            }
        })
    });

    let cap = cfg.max_subscriptions_per_venue;
    let mut desired: HashMap<Venue, Vec<String>> = HashMap::new();
    for event in events {
        for member in &event.members {
            let ids = desired.entry(member.venue).or_default();
            if ids.len() < cap && !ids.contains(&member.id) {
                ids.push(member.id.clone());
            }
        }
    }
    desired
}

/// (to_remove, to_add) between the current and desired sets.
pub fn diff_sets(current: &HashSet<String>, desired: &HashSet<String>) -> (Vec<String>, Vec<String>) {
    let mut to_remove: Vec<String> = current.difference(desired).cloned().collect();
    let mut to_add: Vec<String> = desired.difference(current).cloned().collect();
    to_remove.sort();
    to_add.sort();
    (to_remove, to_add)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TrackedEvent, VenueMarket};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap()
    }

    fn member(venue: Venue, id: &str, start: Option<DateTime<Utc>>) -> VenueMarket {
        VenueMarket {
            id: id.to_string(),
            venue,
            kind: venue.market_kind(),
            title: "event".to_string(),
            home_team: None,
            away_team: None,
            sport: None,
            start_time: start,
            close_time: now() + ChronoDuration::hours(12),
            yes_price_cents: Some(50.0),
            no_price_cents: Some(50.0),
            yes_decimal_odds: None,
            no_decimal_odds: None,
            liquidity_usd: 0.0,
            volume_usd: 0.0,
        }
    }

    fn event(key: &str, status: EventStatus, start: Option<DateTime<Utc>>) -> TrackedEvent {
        TrackedEvent {
            event_key: key.to_string(),
            sport: None,
            home_team: None,
            away_team: None,
            status,
            members: vec![
                member(Venue::Kalshi, &format!("{key}-k"), start),
                member(Venue::Polymarket, &format!("{key}-p"), start),
            ],
            match_quality: 1.0,
            opposing_sides: false,
            first_seen_at: now(),
            last_refreshed_at: now(),
            opportunities_found: 0,
        }
    }

    fn view_of(events: Vec<TrackedEvent>) -> Arc<RegistryView> {
        // Refresh reassigns statuses from start times, so the fixtures pick
        // start times that land on the intended status.
        let registry = EventRegistry::new();
        registry.refresh(events, now());
        registry.load()
    }

    #[test]
    fn live_events_take_priority_under_cap() {
        let live = event("live", EventStatus::Live, Some(now() - ChronoDuration::minutes(10)));
        let pre_soon = event("soon", EventStatus::Pre, Some(now() + ChronoDuration::hours(2)));
        let pre_later = event("later", EventStatus::Pre, Some(now() + ChronoDuration::hours(8)));

        let view = view_of(vec![pre_later.clone(), live.clone(), pre_soon.clone()]);
        let cfg = RuntimeConfig {
            max_subscriptions_per_venue: 2,
            ..RuntimeConfig::default()
        };
        let desired = compute_desired(&view, &cfg);

        let kalshi = &desired[&Venue::Kalshi];
        assert_eq!(kalshi.len(), 2);
        assert_eq!(kalshi[0], "live-k");
        assert_eq!(kalshi[1], "soon-k");
    }

    #[test]
    fn live_events_only_filters_pre() {
        let live = event("live", EventStatus::Live, Some(now() - ChronoDuration::minutes(10)));
        let pre = event("pre", EventStatus::Pre, Some(now() + ChronoDuration::hours(2)));

        let view = view_of(vec![live, pre]);
        let cfg = RuntimeConfig {
            live_events_only: true,
            ..RuntimeConfig::default()
        };
        let desired = compute_desired(&view, &cfg);
        let kalshi = &desired[&Venue::Kalshi];
        assert_eq!(kalshi, &vec!["live-k".to_string()]);
    }

    #[test]
    fn zero_cap_means_no_subscriptions() {
        let view = view_of(vec![event(
            "e1",
            EventStatus::Pre,
            Some(now() + ChronoDuration::hours(2)),
        )]);
        let cfg = RuntimeConfig {
            max_subscriptions_per_venue: 0,
            ..RuntimeConfig::default()
        };
        let desired = compute_desired(&view, &cfg);
        assert!(desired.values().all(|ids| ids.is_empty()));
    }

    #[test]
    fn diff_orders_removals_and_additions() {
        let current: HashSet<String> =
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let desired: HashSet<String> =
            ["b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();

        let (to_remove, to_add) = diff_sets(&current, &desired);
        assert_eq!(to_remove, vec!["a".to_string()]);
        assert_eq!(to_add, vec!["d".to_string(), "e".to_string()]);
    }

    #[test]
    fn converged_sets_yield_empty_diff() {
        let set: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let (to_remove, to_add) = diff_sets(&set, &set.clone());
        assert!(to_remove.is_empty());
        assert!(to_add.is_empty());
    }
}
