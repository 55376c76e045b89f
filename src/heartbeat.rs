// =============================================================================
// Worker Heartbeat — liveness record written to the KV on a fixed cadence
// =============================================================================
//
// The heartbeat loop is fully decoupled from the main loop: a 12-second
// snapshot refresh, a wedged venue socket, or a slow KV write never delays a
// tick. Concurrency control is a single in-flight flag — if the previous
// write is still running when the timer fires, the tick is skipped and the
// skip is logged (rate-limited), never queued.
//
// The flag is released by an RAII guard so no failure path can leak it.
//
// Log discipline: an OK summary at most once per 60 s, errors at most once
// per 30 s.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::evaluator::EvaluatorStats;
use crate::execution::ExecutionStats;
use crate::kv::KvStore;
use crate::price_cache::CacheStats;
use crate::registry::RegistryStats;
use crate::safety::BreakerInfo;
use crate::subscriptions::SubscriptionStats;
use crate::types::WorkerState;
use crate::venues::ConnectionStatus;
use crate::worker::Worker;

/// Bumped whenever the heartbeat shape changes incompatibly. Readers must
/// tolerate unknown fields.
pub const HEARTBEAT_SCHEMA_VERSION: u32 = 1;

/// Default tick cadence; `WORKER_HEARTBEAT_INTERVAL_MS` overrides.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

const OK_LOG_GAP: Duration = Duration::from_secs(60);
const ERR_LOG_GAP: Duration = Duration::from_secs(30);

/// The record written to the KV under the fixed heartbeat key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHeartbeat {
    pub schema_version: u32,
    pub updated_at: DateTime<Utc>,
    pub state: WorkerState,
    pub tick_count: u64,
    pub uptime_secs: u64,
    pub platforms: HashMap<String, ConnectionStatus>,
    pub price_cache: CacheStats,
    pub registry: RegistryStats,
    pub circuit_breaker: BreakerInfo,
    pub blocked_reasons: HashMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<EvaluatorStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriptions: Option<SubscriptionStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub refresh_in_progress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_reason: Option<String>,
}

/// Once-per-gap log gate.
struct LogLimiter {
    gap: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogLimiter {
    fn new(gap: Duration) -> Self {
        Self {
            gap,
            last: Mutex::new(None),
        }
    }

    fn allow(&self) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.gap => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Handle to the heartbeat task.
pub struct HeartbeatLoop {
    tick_count: Arc<AtomicU64>,
}

impl HeartbeatLoop {
    /// Cadence from the environment, or the default.
    pub fn interval_from_env() -> Duration {
        let ms = std::env::var("WORKER_HEARTBEAT_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        Duration::from_millis(ms)
    }

    /// Spawn the loop. Ticks fire on `period` regardless of what the main
    /// loop is doing; the task exits when `shutdown` flips.
    pub fn spawn(
        worker: Arc<Worker>,
        kv: KvStore,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let tick_count = Arc::new(AtomicU64::new(0));
        let ticks = tick_count.clone();

        tokio::spawn(async move {
            let in_flight = Arc::new(AtomicBool::new(false));
            let ok_log = Arc::new(LogLimiter::new(OK_LOG_GAP));
            let err_log = Arc::new(LogLimiter::new(ERR_LOG_GAP));
            let skip_log = LogLimiter::new(ERR_LOG_GAP);

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("heartbeat loop stopped");
                            return;
                        }
                    }
                    _ = ticker.tick() => {}
                }
                if *shutdown.borrow() {
                    return;
                }

                // Skip — never queue — when the previous write is in flight.
                if in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    if skip_log.allow() {
                        warn!("heartbeat tick skipped — previous write still in flight");
                    }
                    continue;
                }

                let tick = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                let record = worker.build_heartbeat(tick, None, None);

                // The write runs detached so a slow KV can never stall the
                // ticker; the guard's Drop releases the flag on every path.
                let guard = InFlightGuard(in_flight.clone());
                let write_kv = kv.clone();
                let ok_log = ok_log.clone();
                let err_log = err_log.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    match write_kv.write_heartbeat(&record).await {
                        Ok(()) => {
                            if ok_log.allow() {
                                info!(
                                    tick,
                                    state = %record.state,
                                    events = record.registry.tracked_events,
                                    cache_points = record.price_cache.total_points,
                                    "heartbeat ok"
                                );
                            }
                        }
                        Err(e) => {
                            if err_log.allow() {
                                warn!(tick, error = %e, "heartbeat write failed");
                            }
                        }
                    }
                });
            }
        });

        Self { tick_count }
    }

    pub fn ticks(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }
}

/// Releases the in-flight flag when dropped, including on panic.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
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
    use crate::price_cache::CacheStats;
    use crate::registry::RegistryStats;
    use crate::safety::{BreakerInfo, BreakerState};

    fn heartbeat(state: WorkerState) -> WorkerHeartbeat {
        WorkerHeartbeat {
            schema_version: HEARTBEAT_SCHEMA_VERSION,
            updated_at: Utc::now(),
            state,
            tick_count: 7,
            uptime_secs: 35,
            platforms: HashMap::new(),
            price_cache: CacheStats {
                points_by_venue: HashMap::new(),
                total_points: 0,
                accepted_updates: 0,
                dropped_stale: 0,
                dropped_malformed: 0,
                handler_panics: 0,
                oldest_age_ms: None,
                newest_age_ms: None,
            },
            registry: RegistryStats {
                tracked_events: 0,
                live_events: 0,
                opportunities_found: 0,
            },
            circuit_breaker: BreakerInfo {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                trips_total: 0,
                cooldown_remaining_ms: None,
            },
            blocked_reasons: HashMap::new(),
            evaluator: None,
            execution: None,
            subscriptions: None,
            last_refresh_at: None,
            refresh_in_progress: false,
            shutdown_reason: None,
        }
    }

    #[test]
    fn heartbeat_serializes_with_schema_version() {
        let hb = heartbeat(WorkerState::Running);
        let json = serde_json::to_value(&hb).unwrap();
        assert_eq!(json["schemaVersion"], 1);
        assert_eq!(json["state"], "RUNNING");
        assert_eq!(json["tickCount"], 7);
        assert_eq!(json["refreshInProgress"], false);
        // Absent optionals are omitted so readers never see nulls.
        assert!(json.get("shutdownReason").is_none());
    }

    #[test]
    fn log_limiter_gates_by_gap() {
        let limiter = LogLimiter::new(Duration::from_secs(60));
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test]
    async fn in_flight_guard_releases_on_drop() {
        let flag = Arc::new(AtomicBool::new(true));
        {
            let _guard = InFlightGuard(flag.clone());
        }
        assert!(!flag.load(Ordering::Acquire));
    }
}
