// =============================================================================
// KV Store — Redis-backed shared state between worker and controller
// =============================================================================
//
// Three uses, three keys:
//   - runtime config (read):   single JSON object at `arb:runtime-config`
//   - worker heartbeat (write): single JSON object at `arb:worker:heartbeat`
//   - opportunity log (write):  LPUSH + LTRIM list per day at
//     `arb:opportunities:YYYY-MM-DD`, 30-day TTL
//
// Every operation carries an explicit deadline so a slow or partitioned
// Redis can never wedge the heartbeat or the main loop.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::heartbeat::WorkerHeartbeat;
use crate::runtime_config::RuntimeConfig;
use crate::types::Opportunity;

/// Key holding the controller-written runtime config object.
pub const RUNTIME_CONFIG_KEY: &str = "arb:runtime-config";

/// Key the heartbeat loop writes on every tick.
pub const HEARTBEAT_KEY: &str = "arb:worker:heartbeat";

/// Prefix for the date-partitioned opportunity log.
const OPPORTUNITY_LOG_PREFIX: &str = "arb:opportunities";

/// Maximum entries retained per daily opportunity list.
const OPPORTUNITY_LOG_MAX_ENTRIES: isize = 10_000;

/// Daily opportunity lists expire after 30 days.
const OPPORTUNITY_LOG_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Deadline applied to every KV read/write.
const KV_DEADLINE: Duration = Duration::from_secs(3);

/// Async Redis handle shared by the heartbeat loop, main loop, and executor.
#[derive(Clone)]
pub struct KvStore {
    conn: ConnectionManager,
    url: String,
}

impl KvStore {
    /// Connect to Redis at `url`. The connection manager reconnects
    /// transparently after transient drops.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to establish Redis connection")?;
        debug!("KV store connected");
        Ok(Self {
            conn,
            url: url.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Runtime config
    // -------------------------------------------------------------------------

    /// Read the controller's runtime config object.
    ///
    /// Returns `None` when the key has never been written; the caller falls
    /// back to `RuntimeConfig::default()`.
    pub async fn read_runtime_config(&self) -> Result<Option<RuntimeConfig>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = tokio::time::timeout(KV_DEADLINE, conn.get(RUNTIME_CONFIG_KEY))
            .await
            .context("runtime config read timed out")?
            .context("runtime config read failed")?;

        match raw {
            Some(json) => {
                let cfg: RuntimeConfig = serde_json::from_str(&json)
                    .context("failed to parse runtime config JSON")?;
                Ok(Some(cfg))
            }
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Heartbeat
    // -------------------------------------------------------------------------

    /// Overwrite the heartbeat record. Called on a fixed cadence by the
    /// heartbeat loop and synchronously during the shutdown sequence.
    pub async fn write_heartbeat(&self, hb: &WorkerHeartbeat) -> Result<()> {
        let json = serde_json::to_string(hb).context("failed to serialize heartbeat")?;
        let mut conn = self.conn.clone();
        tokio::time::timeout(KV_DEADLINE, conn.set::<_, _, ()>(HEARTBEAT_KEY, json))
            .await
            .context("heartbeat write timed out")?
            .context("heartbeat write failed")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Opportunity log
    // -------------------------------------------------------------------------

    /// Append an opportunity to today's log list, trimming to the retention
    /// cap and refreshing the 30-day TTL.
    pub async fn append_opportunity(&self, opp: &Opportunity) -> Result<()> {
        let key = opportunity_log_key(opp.detected_at);
        let json = serde_json::to_string(opp).context("failed to serialize opportunity")?;
        let mut conn = self.conn.clone();

        let push_trim = async {
            conn.lpush::<_, _, ()>(&key, json).await?;
            conn.ltrim::<_, ()>(&key, 0, OPPORTUNITY_LOG_MAX_ENTRIES - 1)
                .await?;
            conn.expire::<_, ()>(&key, OPPORTUNITY_LOG_TTL_SECS).await?;
            Ok::<_, redis::RedisError>(())
        };

        tokio::time::timeout(KV_DEADLINE, push_trim)
            .await
            .context("opportunity log write timed out")?
            .context("opportunity log write failed")?;

        debug!(key = %key, id = %opp.id, "opportunity appended to log");
        Ok(())
    }
}

/// Build the date-partitioned opportunity log key for `at`.
fn opportunity_log_key(at: DateTime<Utc>) -> String {
    format!("{}:{}", OPPORTUNITY_LOG_PREFIX, at.format("%Y-%m-%d"))
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Redis URLs may embed credentials.
        f.debug_struct("KvStore")
            .field("url", &"<redacted>")
            .finish()
    }
}
