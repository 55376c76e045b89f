// =============================================================================
// Event Registry — owns the live set of tracked events
// =============================================================================
//
// Read-mostly store for the matcher's output. `refresh` computes the next
// view entirely off the hot path and installs it with one atomic swap, so an
// evaluation sees either the whole old registry or the whole new one, never a
// partial rebuild. Listeners receive (added, removed, modified) diffs so the
// subscription manager can reconcile incrementally.
//
// Status assignment happens here, at swap time: a member whose start time
// falls inside (now − maxGameDuration(sport), now + buffer) and whose venue
// still lists the market open makes its event LIVE.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::{EventStatus, TrackedEvent, Venue};

/// A market is considered about-to-start this long before its start time.
const LIVE_START_BUFFER_MINS: i64 = 15;

/// Ended events are garbage-collected this long after their close time.
const GC_GRACE_MINS: i64 = 60;

/// Immutable snapshot of all tracked events plus a member lookup index.
pub struct RegistryView {
    pub events: Vec<TrackedEvent>,
    member_index: HashMap<(Venue, String), usize>,
}

impl RegistryView {
    pub fn empty() -> Self {
        Self {
            events: Vec::new(),
            member_index: HashMap::new(),
        }
    }

    fn from_events(events: Vec<TrackedEvent>) -> Self {
        let mut member_index = HashMap::new();
        for (idx, event) in events.iter().enumerate() {
            for member in &event.members {
                member_index.insert((member.venue, member.id.clone()), idx);
            }
        }
        Self {
            events,
            member_index,
        }
    }

    /// The event containing `market_id` on `venue`, if tracked.
    pub fn find_by_member(&self, venue: Venue, market_id: &str) -> Option<&TrackedEvent> {
        self.member_index
            .get(&(venue, market_id.to_string()))
            .map(|&idx| &self.events[idx])
    }

    pub fn get(&self, event_key: &str) -> Option<&TrackedEvent> {
        self.events.iter().find(|e| e.event_key == event_key)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Diff between two consecutive registry views, by event key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Serializable registry statistics for the heartbeat.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub tracked_events: usize,
    pub live_events: usize,
    pub opportunities_found: u64,
}

type DiffListener = Box<dyn Fn(&RegistryDiff) + Send + Sync>;

pub struct EventRegistry {
    view: ArcSwap<RegistryView>,
    listeners: RwLock<Vec<DiffListener>>,
    /// Opportunity counts survive refreshes; keyed by event key.
    opp_counts: RwLock<HashMap<String, u64>>,
    listener_panics: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            view: ArcSwap::from_pointee(RegistryView::empty()),
            listeners: RwLock::new(Vec::new()),
            opp_counts: RwLock::new(HashMap::new()),
            listener_panics: AtomicU64::new(0),
        }
    }

    /// Atomic snapshot of the current view.
    pub fn load(&self) -> Arc<RegistryView> {
        self.view.load_full()
    }

    /// Register a diff listener, called synchronously after each swap.
    pub fn subscribe(&self, listener: impl Fn(&RegistryDiff) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    /// Bump the opportunity counter for an event. The count is folded into
    /// the event at the next refresh and reported in stats immediately.
    pub fn record_opportunity(&self, event_key: &str) {
        *self
            .opp_counts
            .write()
            .entry(event_key.to_string())
            .or_insert(0) += 1;
    }

    /// Install the matcher's newest output as the current view.
    ///
    /// Carries `first_seen_at` and opportunity counts over from the previous
    /// view, assigns statuses as of `now`, garbage-collects events past their
    /// close-time grace, and notifies listeners with the diff.
    pub fn refresh(&self, matched: Vec<TrackedEvent>, now: DateTime<Utc>) -> RegistryDiff {
        let old = self.load();
        let old_keys: HashMap<&str, &TrackedEvent> = old
            .events
            .iter()
            .map(|e| (e.event_key.as_str(), e))
            .collect();

        let counts = self.opp_counts.read().clone();

        let mut next: Vec<TrackedEvent> = Vec::with_capacity(matched.len());
        for mut event in matched {
            if let Some(prev) = old_keys.get(event.event_key.as_str()) {
                event.first_seen_at = prev.first_seen_at;
            }
            event.last_refreshed_at = now;
            event.status = assign_status(&event, now);
            event.opportunities_found = counts.get(&event.event_key).copied().unwrap_or(0);

            if event.status == EventStatus::Ended && past_grace(&event, now) {
                continue;
            }
            next.push(event);
        }

        // Diff against the outgoing view.
        let new_keys: HashSet<&str> = next.iter().map(|e| e.event_key.as_str()).collect();
        let mut diff = RegistryDiff::default();
        for event in &next {
            match old_keys.get(event.event_key.as_str()) {
                None => diff.added.push(event.event_key.clone()),
                Some(prev) => {
                    if changed(prev, event) {
                        diff.modified.push(event.event_key.clone());
                    }
                }
            }
        }
        for event in &old.events {
            if !new_keys.contains(event.event_key.as_str()) {
                diff.removed.push(event.event_key.clone());
            }
        }

        // Drop counters for events no longer tracked.
        self.opp_counts
            .write()
            .retain(|key, _| new_keys.contains(key.as_str()));

        debug!(
            tracked = next.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "registry refreshed"
        );

        self.view.store(Arc::new(RegistryView::from_events(next)));
        self.notify(&diff);
        diff
    }

    pub fn stats(&self) -> RegistryStats {
        let view = self.load();
        RegistryStats {
            tracked_events: view.events.len(),
            live_events: view
                .events
                .iter()
                .filter(|e| e.status == EventStatus::Live)
                .count(),
            opportunities_found: self.opp_counts.read().values().sum(),
        }
    }

    fn notify(&self, diff: &RegistryDiff) {
        if diff.is_empty() {
            return;
        }
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(diff))).is_err() {
                let n = self.listener_panics.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(panics = n, "registry diff listener panicked");
            }
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Did anything the subscription manager or evaluator cares about change?
fn changed(prev: &TrackedEvent, next: &TrackedEvent) -> bool {
    if prev.status != next.status || prev.members.len() != next.members.len() {
        return true;
    }
    prev.members
        .iter()
        .zip(next.members.iter())
        .any(|(a, b)| a.venue != b.venue || a.id != b.id)
}

/// Longest plausible duration of a game, per sport family.
fn max_game_duration_mins(sport: Option<&str>) -> i64 {
    match sport.map(|s| s.to_lowercase()).as_deref() {
        Some("soccer") => 150,
        Some("basketball") => 180,
        Some("hockey") => 210,
        Some("football") => 240,
        Some("baseball") => 300,
        Some("tennis") => 300,
        _ => 240,
    }
}

fn assign_status(event: &TrackedEvent, now: DateTime<Utc>) -> EventStatus {
    let buffer = Duration::minutes(LIVE_START_BUFFER_MINS);
    let max_duration = Duration::minutes(max_game_duration_mins(event.sport.as_deref()));

    let mut any_open_future = false;
    for member in &event.members {
        let open = member.close_time > now;
        match member.start_time {
            Some(start) => {
                // Start inside (now − maxGameDuration, now + buffer) and the
                // venue still lists the market open → the game is on.
                if open && start > now - max_duration && start < now + buffer {
                    return EventStatus::Live;
                }
                if start >= now + buffer {
                    any_open_future = true;
                }
            }
            None => {
                // Threshold-style events have no start; they are PRE while
                // any venue keeps them open.
                if open {
                    any_open_future = true;
                }
            }
        }
    }

    if any_open_future {
        EventStatus::Pre
    } else {
        EventStatus::Ended
    }
}

/// Past the close time of every member plus the GC grace window.
fn past_grace(event: &TrackedEvent, now: DateTime<Utc>) -> bool {
    let latest_close = event.members.iter().map(|m| m.close_time).max();
    match latest_close {
        Some(close) => now > close + Duration::minutes(GC_GRACE_MINS),
        None => true,
    }
}
