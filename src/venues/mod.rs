// =============================================================================
// Venue Stream Clients — one persistent WebSocket per venue
// =============================================================================
//
// Each venue speaks its own wire protocol; everything protocol-specific lives
// behind the `VenueProtocol` trait (URL, subscribe frames, heartbeat payload,
// message parsing). The shared `StreamClient` owns the socket lifecycle:
//
//   DISABLED → IDLE → CONNECTING → CONNECTED ↔ RECONNECTING → ERROR
//
// Reconnects back off exponentially (base 1 s, ×2, ±20 % jitter, cap 30 s)
// and give up into ERROR after 10 attempts inside a rolling 5-minute window.
// On every transition to CONNECTED the full subscription set is re-applied
// before the read loop starts, so no update between handshake and
// resubscribe is silently missed.
//
// One socket, one task. Nothing else touches the stream.
// =============================================================================

pub mod kalshi;
pub mod polymarket;
pub mod sxbet;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::price_cache::PriceCache;
use crate::types::{PriceUpdate, Venue};

/// Connection lifecycle states, observable through the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disabled,
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disabled => "DISABLED",
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Snapshot of one client's health for observers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_message_at_ms: Option<i64>,
    pub subscribed_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub parse_errors_total: u64,
    pub parse_error_ratio: f64,
}

impl ConnectionStatus {
    fn new(state: ConnectionState) -> Self {
        Self {
            state,
            last_message_at_ms: None,
            subscribed_count: 0,
            error_message: None,
            parse_errors_total: 0,
            parse_error_ratio: 0.0,
        }
    }
}

/// One parsed inbound frame. Venue messages are heterogeneous; parsing always
/// lands on an explicit variant so nothing is half-handled.
#[derive(Debug, Clone)]
pub enum VenueMessage {
    Price(PriceUpdate),
    /// Live score/state updates — recognized, currently unused.
    Score,
    Ack,
    HeartbeatEcho,
    Unknown,
}

/// Everything venue-specific about one stream.
pub trait VenueProtocol: Send + Sync + 'static {
    fn venue(&self) -> Venue;

    fn ws_url(&self) -> &str;

    /// Maximum market ids per subscribe/unsubscribe frame.
    fn max_batch_size(&self) -> usize {
        50
    }

    fn subscribe_frames(&self, ids: &[String]) -> Vec<String>;

    fn unsubscribe_frames(&self, ids: &[String]) -> Vec<String>;

    /// Application-level heartbeat payload and cadence, when the venue
    /// defines one. Venues without it rely on transport pings.
    fn heartbeat(&self) -> Option<(String, Duration)> {
        None
    }

    /// Parse one text frame. Errors are expressed as `Err`, which feeds the
    /// parse-error ratio; unrecognized-but-well-formed frames are
    /// `Ok(vec![VenueMessage::Unknown])`.
    fn parse(&self, text: &str) -> Result<Vec<VenueMessage>>;
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Exponential backoff with jitter and a rolling attempt window.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    max_attempts: usize,
    window: Duration,
    attempt: u32,
    attempts_at: VecDeque<Instant>,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: 10,
            window: Duration::from_secs(300),
            attempt: 0,
            attempts_at: VecDeque::new(),
        }
    }

    /// Delay before the next attempt, or `None` once the rolling window is
    /// exhausted (the caller transitions to ERROR).
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        while let Some(&front) = self.attempts_at.front() {
            if now.duration_since(front) > self.window {
                self.attempts_at.pop_front();
            } else {
                break;
            }
        }
        if self.attempts_at.len() >= self.max_attempts {
            return None;
        }
        self.attempts_at.push_back(now);

        let exp = self.base.as_millis() as f64 * 2f64.powi(self.attempt as i32);
        let capped = exp.min(self.cap.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);

        let spread = capped * self.jitter;
        let jittered = capped + rand::thread_rng().gen_range(-spread..=spread);
        Some(Duration::from_millis(jittered.max(0.0) as u64))
    }

    /// Base delay for attempt `n` without jitter; exposed for tests.
    fn base_delay_ms(&self, n: u32) -> u64 {
        let exp = self.base.as_millis() as f64 * 2f64.powi(n as i32);
        exp.min(self.cap.as_millis() as f64) as u64
    }

    /// Forget the failure streak after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.attempts_at.clear();
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Parse-error ratio
// ---------------------------------------------------------------------------

/// Outcome ring over the last 1000 inbound frames. A sustained error ratio
/// above 10 % flags a broken feed and forces a reconnect.
pub struct ParseStats {
    window: VecDeque<bool>,
    errors_total: u64,
}

const PARSE_WINDOW: usize = 1000;
const PARSE_ERROR_RATIO_LIMIT: f64 = 0.10;
/// Don't judge the ratio until the sample is meaningful.
const PARSE_MIN_SAMPLE: usize = 50;

impl ParseStats {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(PARSE_WINDOW),
            errors_total: 0,
        }
    }

    pub fn record(&mut self, ok: bool) {
        if self.window.len() == PARSE_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(ok);
        if !ok {
            self.errors_total += 1;
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let errors = self.window.iter().filter(|ok| !**ok).count();
        errors as f64 / self.window.len() as f64
    }

    pub fn errors_total(&self) -> u64 {
        self.errors_total
    }

    pub fn breached(&self) -> bool {
        self.window.len() >= PARSE_MIN_SAMPLE && self.ratio() > PARSE_ERROR_RATIO_LIMIT
    }
}

impl Default for ParseStats {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Stream client
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum StreamCommand {
    Connect,
    Disconnect,
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// Handle to one venue's stream task. Cloneable; all clones address the same
/// socket task.
#[derive(Clone)]
pub struct StreamClient {
    venue: Venue,
    cmd_tx: Option<mpsc::Sender<StreamCommand>>,
    status: Arc<RwLock<ConnectionStatus>>,
    state_rx: watch::Receiver<ConnectionState>,
    subscribed: Arc<RwLock<HashSet<String>>>,
}

impl StreamClient {
    /// Spawn the socket task for `protocol`. The client starts IDLE and
    /// connects when `connect()` is called.
    pub fn spawn(
        protocol: Arc<dyn VenueProtocol>,
        cache: Arc<PriceCache>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let venue = protocol.venue();
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let status = Arc::new(RwLock::new(ConnectionStatus::new(ConnectionState::Idle)));
        let subscribed = Arc::new(RwLock::new(HashSet::new()));

        let runner = StreamRunner {
            protocol,
            cache,
            status: status.clone(),
            state_tx,
            subscribed: subscribed.clone(),
            parse_stats: ParseStats::new(),
            shutdown,
        };
        tokio::spawn(runner.run(cmd_rx));

        Self {
            venue,
            cmd_tx: Some(cmd_tx),
            status,
            state_rx,
            subscribed,
        }
    }

    /// A permanently disabled client for a venue with no credentials. No
    /// task, no socket; every operation is a no-op.
    pub fn disabled(venue: Venue) -> Self {
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Disabled);
        Self {
            venue,
            cmd_tx: None,
            status: Arc::new(RwLock::new(ConnectionStatus::new(ConnectionState::Disabled))),
            state_rx,
            subscribed: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    pub fn is_disabled(&self) -> bool {
        self.cmd_tx.is_none()
    }

    pub fn connect(&self) {
        self.send(StreamCommand::Connect);
    }

    pub fn disconnect(&self) {
        self.send(StreamCommand::Disconnect);
    }

    /// Idempotent over the desired set: already-subscribed ids are skipped.
    pub fn subscribe_markets(&self, ids: &[String]) {
        if self.is_disabled() {
            return;
        }
        let fresh: Vec<String> = {
            let current = self.subscribed.read();
            ids.iter().filter(|id| !current.contains(*id)).cloned().collect()
        };
        if fresh.is_empty() {
            return;
        }
        {
            let mut current = self.subscribed.write();
            for id in &fresh {
                current.insert(id.clone());
            }
        }
        self.status.write().subscribed_count = self.subscribed.read().len();
        self.send(StreamCommand::Subscribe(fresh));
    }

    pub fn unsubscribe_markets(&self, ids: &[String]) {
        if self.is_disabled() {
            return;
        }
        let present: Vec<String> = {
            let current = self.subscribed.read();
            ids.iter().filter(|id| current.contains(*id)).cloned().collect()
        };
        if present.is_empty() {
            return;
        }
        {
            let mut current = self.subscribed.write();
            for id in &present {
                current.remove(id);
            }
        }
        self.status.write().subscribed_count = self.subscribed.read().len();
        self.send(StreamCommand::Unsubscribe(present));
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch channel carrying every state transition; the subscription
    /// manager uses this to re-reconcile on CONNECTED.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn subscribed_ids(&self) -> HashSet<String> {
        self.subscribed.read().clone()
    }

    fn send(&self, cmd: StreamCommand) {
        if let Some(tx) = &self.cmd_tx {
            if tx.try_send(cmd).is_err() {
                warn!(venue = %self.venue, "stream command queue full — command dropped");
            }
        }
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("venue", &self.venue)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Socket task
// ---------------------------------------------------------------------------

/// Deadline for the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct StreamRunner {
    protocol: Arc<dyn VenueProtocol>,
    cache: Arc<PriceCache>,
    status: Arc<RwLock<ConnectionStatus>>,
    state_tx: watch::Sender<ConnectionState>,
    subscribed: Arc<RwLock<HashSet<String>>>,
    parse_stats: ParseStats,
    shutdown: watch::Receiver<bool>,
}

/// Why a connected session ended.
enum SessionEnd {
    Disconnected,
    SocketLost,
    ParseRatioBreached,
    Shutdown,
}

impl StreamRunner {
    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        {
            let mut status = self.status.write();
            status.state = state;
            status.error_message = error;
            status.parse_errors_total = self.parse_stats.errors_total();
            status.parse_error_ratio = self.parse_stats.ratio();
        }
        let _ = self.state_tx.send(state);
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<StreamCommand>) {
        let venue = self.protocol.venue();

        'idle: loop {
            // IDLE: wait for a connect request.
            loop {
                tokio::select! {
                    _ = self.shutdown.changed() => {
                        if *self.shutdown.borrow() {
                            self.set_state(ConnectionState::Idle, None);
                            return;
                        }
                    }
                    cmd = cmd_rx.recv() => match cmd {
                        Some(StreamCommand::Connect) => break,
                        Some(_) => {} // subscriptions accumulate in the desired set
                        None => return,
                    }
                }
            }

            // CONNECTING / RECONNECTING with backoff.
            let mut backoff = Backoff::new();
            let mut first_attempt = true;
            loop {
                if *self.shutdown.borrow() {
                    self.set_state(ConnectionState::Idle, None);
                    return;
                }

                self.set_state(
                    if first_attempt {
                        ConnectionState::Connecting
                    } else {
                        ConnectionState::Reconnecting
                    },
                    None,
                );

                match self.connect_once(&mut cmd_rx).await {
                    Ok(SessionEnd::Disconnected) => {
                        info!(venue = %venue, "stream disconnected by request");
                        self.subscribed.write().clear();
                        self.status.write().subscribed_count = 0;
                        self.set_state(ConnectionState::Idle, None);
                        continue 'idle;
                    }
                    Ok(SessionEnd::Shutdown) => {
                        self.set_state(ConnectionState::Idle, None);
                        return;
                    }
                    Ok(SessionEnd::SocketLost) => {
                        // The session did connect; the failure streak restarts.
                        backoff.reset();
                        warn!(venue = %venue, "stream socket lost — scheduling reconnect");
                    }
                    Ok(SessionEnd::ParseRatioBreached) => {
                        error!(
                            venue = %venue,
                            ratio = self.parse_stats.ratio(),
                            "parse error ratio breached — scheduling reconnect"
                        );
                        self.set_state(
                            ConnectionState::Error,
                            Some("parse error ratio exceeded".to_string()),
                        );
                        self.parse_stats = ParseStats::new();
                    }
                    Err(e) => {
                        warn!(venue = %venue, error = %e, "stream connect failed");
                    }
                }

                first_attempt = false;
                match backoff.next_delay(Instant::now()) {
                    Some(delay) => {
                        debug!(venue = %venue, delay_ms = delay.as_millis() as u64, "reconnect backoff");
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = self.shutdown.changed() => {
                                if *self.shutdown.borrow() {
                                    self.set_state(ConnectionState::Idle, None);
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        error!(venue = %venue, "reconnect attempts exhausted — entering ERROR");
                        self.set_state(
                            ConnectionState::Error,
                            Some("max reconnect attempts exceeded".to_string()),
                        );
                        // ERROR holds until an explicit reconfigure/connect.
                        continue 'idle;
                    }
                }
            }
        }
    }

    /// One connected session: handshake, resubscribe, then read until the
    /// socket drops or a command ends the session.
    async fn connect_once(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<StreamCommand>,
    ) -> Result<SessionEnd> {
        let venue = self.protocol.venue();
        let url = self.protocol.ws_url().to_string();
        debug!(venue = %venue, url = %url, "connecting stream");

        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url))
            .await
            .context("websocket handshake timed out")?
            .context("websocket handshake failed")?;

        let (mut write, mut read) = ws_stream.split();

        // Re-apply the full subscription set before any price parsing, so a
        // reconnect can never miss updates for markets we were tracking.
        let desired: Vec<String> = self.subscribed.read().iter().cloned().collect();
        for frame in batched_frames(&*self.protocol, &desired, true) {
            write
                .send(Message::Text(frame))
                .await
                .context("failed to send resubscribe frame")?;
        }
        if !desired.is_empty() {
            info!(venue = %venue, count = desired.len(), "subscriptions re-applied");
        }

        self.set_state(ConnectionState::Connected, None);
        info!(venue = %venue, "stream connected");

        // Application heartbeat, when the venue defines one.
        let (hb_payload, hb_period) = match self.protocol.heartbeat() {
            Some((payload, period)) => (Some(payload), period),
            None => (None, Duration::from_secs(3600)),
        };
        let mut hb_tick = interval(hb_period);
        hb_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        hb_tick.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                _ = hb_tick.tick() => {
                    if let Some(payload) = &hb_payload {
                        if write.send(Message::Text(payload.clone())).await.is_err() {
                            return Ok(SessionEnd::SocketLost);
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(StreamCommand::Subscribe(ids)) => {
                            for frame in batched_frames(&*self.protocol, &ids, true) {
                                if write.send(Message::Text(frame)).await.is_err() {
                                    return Ok(SessionEnd::SocketLost);
                                }
                            }
                        }
                        Some(StreamCommand::Unsubscribe(ids)) => {
                            for frame in batched_frames(&*self.protocol, &ids, false) {
                                if write.send(Message::Text(frame)).await.is_err() {
                                    return Ok(SessionEnd::SocketLost);
                                }
                            }
                            for id in &ids {
                                self.cache.remove_market(venue, id);
                            }
                        }
                        Some(StreamCommand::Disconnect) => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(SessionEnd::Disconnected);
                        }
                        Some(StreamCommand::Connect) | None => {}
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(&text);
                            if self.parse_stats.breached() {
                                return Ok(SessionEnd::ParseRatioBreached);
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if write.send(Message::Pong(payload)).await.is_err() {
                                return Ok(SessionEnd::SocketLost);
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(venue = %venue, ?frame, "stream close frame");
                            return Ok(SessionEnd::SocketLost);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(venue = %venue, error = %e, "stream read error");
                            return Ok(SessionEnd::SocketLost);
                        }
                        None => {
                            warn!(venue = %venue, "stream ended");
                            return Ok(SessionEnd::SocketLost);
                        }
                    }
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        match self.protocol.parse(text) {
            Ok(messages) => {
                self.parse_stats.record(true);
                let mut status = self.status.write();
                status.last_message_at_ms = Some(crate::types::now_ms());
                drop(status);

                for message in messages {
                    match message {
                        VenueMessage::Price(update) => self.cache.put(update),
                        VenueMessage::Score
                        | VenueMessage::Ack
                        | VenueMessage::HeartbeatEcho
                        | VenueMessage::Unknown => {}
                    }
                }
            }
            Err(e) => {
                self.parse_stats.record(false);
                let mut status = self.status.write();
                status.parse_errors_total = self.parse_stats.errors_total();
                status.parse_error_ratio = self.parse_stats.ratio();
                drop(status);
                debug!(venue = %self.protocol.venue(), error = %e, "malformed venue message dropped");
            }
        }
    }
}

/// Chunk ids to the venue's frame size and render subscribe/unsubscribe
/// frames.
fn batched_frames(protocol: &dyn VenueProtocol, ids: &[String], subscribe: bool) -> Vec<String> {
    let batch = protocol.max_batch_size().max(1);
    let mut frames = Vec::new();
    for chunk in ids.chunks(batch) {
        let rendered = if subscribe {
            protocol.subscribe_frames(chunk)
        } else {
            protocol.unsubscribe_frames(chunk)
        };
        frames.extend(rendered);
    }
    frames
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::new();
        assert_eq!(backoff.base_delay_ms(0), 1_000);
        assert_eq!(backoff.base_delay_ms(1), 2_000);
        assert_eq!(backoff.base_delay_ms(2), 4_000);
        assert_eq!(backoff.base_delay_ms(4), 16_000);
        assert_eq!(backoff.base_delay_ms(5), 30_000);
        assert_eq!(backoff.base_delay_ms(9), 30_000);
    }

    #[tokio::test]
    async fn backoff_jitter_stays_within_twenty_percent() {
        let mut backoff = Backoff::new();
        let now = Instant::now();
        let delay = backoff.next_delay(now).unwrap();
        let ms = delay.as_millis() as f64;
        assert!((800.0..=1200.0).contains(&ms), "jittered delay {ms} out of band");
    }

    #[tokio::test]
    async fn backoff_exhausts_after_ten_attempts_in_window() {
        let mut backoff = Backoff::new();
        let now = Instant::now();
        for _ in 0..10 {
            assert!(backoff.next_delay(now).is_some());
        }
        assert!(backoff.next_delay(now).is_none());

        backoff.reset();
        assert!(backoff.next_delay(now).is_some());
    }

    #[test]
    fn parse_stats_ratio_and_breach() {
        let mut stats = ParseStats::new();
        for _ in 0..45 {
            stats.record(true);
        }
        for _ in 0..5 {
            stats.record(false);
        }
        assert!((stats.ratio() - 0.10).abs() < 1e-9);
        // Exactly at the limit is not a breach; strictly above is.
        assert!(!stats.breached());
        stats.record(false);
        assert!(stats.breached());
        assert_eq!(stats.errors_total(), 6);
    }

    #[test]
    fn parse_stats_needs_minimum_sample() {
        let mut stats = ParseStats::new();
        for _ in 0..10 {
            stats.record(false);
        }
        assert_eq!(stats.ratio(), 1.0);
        assert!(!stats.breached());
    }

    #[test]
    fn disabled_client_ignores_everything() {
        let client = StreamClient::disabled(Venue::SxBet);
        assert!(client.is_disabled());
        assert_eq!(client.state(), ConnectionState::Disabled);

        client.connect();
        client.subscribe_markets(&["m1".to_string()]);
        assert_eq!(client.state(), ConnectionState::Disabled);
        assert!(client.subscribed_ids().is_empty());
        assert_eq!(client.status().state, ConnectionState::Disabled);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_restores_initial_state() {
        // Desired-set semantics; the frames go nowhere because the runner
        // never gets a connect, but the set round-trips exactly.
        let cache = Arc::new(PriceCache::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let protocol = Arc::new(kalshi::KalshiProtocol::with_url(
            "wss://example.invalid/ws".to_string(),
            "test-key".to_string(),
        ));
        let client = StreamClient::spawn(protocol, cache, shutdown_rx);

        let before = client.subscribed_ids();
        client.subscribe_markets(&["m1".to_string(), "m2".to_string()]);
        assert_eq!(client.subscribed_ids().len(), 2);
        // Re-subscribing the same ids is a no-op.
        client.subscribe_markets(&["m1".to_string()]);
        assert_eq!(client.subscribed_ids().len(), 2);

        client.unsubscribe_markets(&["m1".to_string(), "m2".to_string()]);
        assert_eq!(client.subscribed_ids(), before);
        assert_eq!(client.status().subscribed_count, 0);
    }
}
