// =============================================================================
// Polaris Arb Scout — Main Entry Point
// =============================================================================
//
// Long-running worker, no interactive surface: configuration comes from the
// KV store and the process environment, observability goes out through the
// KV heartbeat, and standard termination signals drive the shutdown
// sequence (STOPPING → drain → STOPPED).
//
// The worker starts IDLE; a controller flips `liveArbEnabled` in the KV to
// bring the pipeline up.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod discovery;
mod evaluator;
mod execution;
mod heartbeat;
mod kv;
mod matcher;
mod price_cache;
mod registry;
mod runtime_config;
mod safety;
mod subscriptions;
mod types;
mod venues;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::discovery::DiscoveryClient;
use crate::heartbeat::HeartbeatLoop;
use crate::kv::KvStore;
use crate::runtime_config::RuntimeConfig;
use crate::types::WorkerState;
use crate::worker::Worker;

/// Pause between the STOPPING and STOPPED heartbeats so external observers
/// can witness the transition.
const STOPPING_DELAY: Duration = Duration::from_millis(1_500);

/// Default ceiling on the whole shutdown sequence;
/// `WORKER_SHUTDOWN_GRACE_MS` overrides.
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 25_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Polaris Arb Scout — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. KV + STARTING heartbeat (before any heavy initialization) ─────
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let kv = match KvStore::connect(&redis_url).await {
        Ok(kv) => Some(kv),
        Err(e) => {
            // The worker still runs; the heartbeat just goes stale externally.
            warn!(error = %e, "KV unavailable — continuing without heartbeat/config store");
            None
        }
    };

    let mut initial_config = RuntimeConfig::default();
    if let Ok(refresh_ms) = std::env::var("REFRESH_MS") {
        if let Ok(ms) = refresh_ms.parse::<u64>() {
            initial_config.refresh_interval_ms = ms;
        }
    }

    let worker = Worker::new(initial_config, kv.clone(), DiscoveryClient::from_env());

    if let Some(kv) = &kv {
        let starting = worker.build_heartbeat(0, Some(WorkerState::Starting), None);
        if let Err(e) = kv.write_heartbeat(&starting).await {
            warn!(error = %e, "failed to write STARTING heartbeat");
        }
    }

    // ── 3. Remote config load ────────────────────────────────────────────
    if let Some(kv) = &kv {
        match kv.read_runtime_config().await {
            Ok(Some(cfg)) => {
                info!(live_arb_enabled = cfg.live_arb_enabled, "runtime config loaded from KV");
                worker
                    .breaker
                    .configure(cfg.breaker_failure_threshold, cfg.breaker_cooldown_ms);
                *worker.config.write() = cfg;
            }
            Ok(None) => info!("no runtime config in KV — using defaults"),
            Err(e) => warn!(error = %e, "runtime config load failed — using defaults"),
        }
    }

    // ── 4. Heartbeat + main loops ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat = kv.as_ref().map(|kv| {
        HeartbeatLoop::spawn(
            worker.clone(),
            kv.clone(),
            HeartbeatLoop::interval_from_env(),
            shutdown_rx.clone(),
        )
    });

    let main_loop = tokio::spawn(worker.clone().run(shutdown_rx));

    info!("worker loops running — waiting for enablement and signals");

    // ── 5. Wait for a termination signal ─────────────────────────────────
    let reason = wait_for_termination().await;
    warn!(reason = %reason, "shutdown signal received");

    // ── 6. Graceful shutdown within the grace window ─────────────────────
    let grace_ms = std::env::var("WORKER_SHUTDOWN_GRACE_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS);

    let sequence = shutdown_sequence(
        worker.clone(),
        kv.clone(),
        heartbeat,
        shutdown_tx,
        main_loop,
        reason,
    );
    if tokio::time::timeout(Duration::from_millis(grace_ms), sequence)
        .await
        .is_err()
    {
        error!(grace_ms, "graceful shutdown exceeded grace window — forcing exit");
        std::process::exit(1);
    }

    info!("Polaris Arb Scout shut down complete.");
    Ok(())
}

/// SIGINT (Ctrl+C) and, on Unix, SIGTERM.
async fn wait_for_termination() -> String {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT".to_string(),
            _ = sigterm.recv() => "SIGTERM".to_string(),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT".to_string()
    }
}

/// The ordered shutdown: STOPPING heartbeat → stop loops and disconnect →
/// observable pause → STOPPED heartbeat.
async fn shutdown_sequence(
    worker: Arc<Worker>,
    kv: Option<KvStore>,
    heartbeat: Option<HeartbeatLoop>,
    shutdown_tx: watch::Sender<bool>,
    main_loop: tokio::task::JoinHandle<()>,
    reason: String,
) {
    // 1. STOPPING, written immediately with the reason.
    worker.set_state(WorkerState::Stopping);
    let tick = heartbeat.as_ref().map(|h| h.ticks()).unwrap_or(0);
    if let Some(kv) = &kv {
        let hb = worker.build_heartbeat(tick + 1, Some(WorkerState::Stopping), Some(reason.clone()));
        if let Err(e) = kv.write_heartbeat(&hb).await {
            warn!(error = %e, "failed to write STOPPING heartbeat");
        }
    }

    // 2–3. Stop the heartbeat timer, the main loop, the pipeline, and the
    // stream clients; every loop honors this signal.
    let _ = shutdown_tx.send(true);
    if let Err(e) = main_loop.await {
        warn!(error = %e, "main loop join failed during shutdown");
    }

    // 4. Let external observers witness STOPPING.
    tokio::time::sleep(STOPPING_DELAY).await;

    // 5. STOPPED.
    worker.set_state(WorkerState::Stopped);
    if let Some(kv) = &kv {
        let hb = worker.build_heartbeat(tick + 2, Some(WorkerState::Stopped), Some(reason));
        if let Err(e) = kv.write_heartbeat(&hb).await {
            warn!(error = %e, "failed to write STOPPED heartbeat");
        }
    }
}
