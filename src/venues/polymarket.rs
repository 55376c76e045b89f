// =============================================================================
// Polymarket stream protocol — prediction venue quoting decimals in [0,1]
// =============================================================================
//
// Prices arrive as decimal probabilities and are scaled to cents on ingest.
// Only the YES token is streamed per market; the price cache derives the
// complementary NO point from every accepted YES update.
//
// The venue expects "PING" text frames as an application heartbeat and
// answers "PONG".
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};

use crate::types::{now_ms, round_implied, Outcome, PriceKey, PriceSource, PriceUpdate, Venue};

use super::{VenueMessage, VenueProtocol};

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);

pub struct PolymarketProtocol {
    url: String,
}

impl PolymarketProtocol {
    /// Build from environment. `None` (→ DISABLED client) when the stream
    /// URL is not configured.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("POLYMARKET_WS_URL").ok()?;
        if url.trim().is_empty() {
            return None;
        }
        Some(Self { url })
    }

    pub fn with_url(url: String) -> Self {
        Self { url }
    }
}

impl VenueProtocol for PolymarketProtocol {
    fn venue(&self) -> Venue {
        Venue::Polymarket
    }

    fn ws_url(&self) -> &str {
        &self.url
    }

    fn max_batch_size(&self) -> usize {
        100
    }

    fn subscribe_frames(&self, ids: &[String]) -> Vec<String> {
        vec![serde_json::json!({
            "assets_ids": ids,
            "operation": "subscribe",
        })
        .to_string()]
    }

    fn unsubscribe_frames(&self, ids: &[String]) -> Vec<String> {
        vec![serde_json::json!({
            "assets_ids": ids,
            "operation": "unsubscribe",
        })
        .to_string()]
    }

    fn heartbeat(&self) -> Option<(String, Duration)> {
        Some(("PING".to_string(), HEARTBEAT_PERIOD))
    }

    fn parse(&self, text: &str) -> Result<Vec<VenueMessage>> {
        if text.eq_ignore_ascii_case("pong") {
            return Ok(vec![VenueMessage::HeartbeatEcho]);
        }

        let root: serde_json::Value =
            serde_json::from_str(text).context("polymarket message is not JSON")?;
        let event_type = root["event_type"].as_str().unwrap_or("");

        match event_type {
            "price_change" => {
                let asset_id = root["asset_id"]
                    .as_str()
                    .context("price_change missing asset_id")?;
                let price = decimal_field(&root, "price")
                    .context("price_change missing price")?;
                let best_bid = decimal_field(&root, "best_bid");
                let best_ask = decimal_field(&root, "best_ask");
                Ok(vec![price_update(asset_id, price, best_bid, best_ask)])
            }
            "book" => {
                let asset_id = root["asset_id"]
                    .as_str()
                    .context("book missing asset_id")?;
                let best_bid = top_of_side(&root["bids"], true);
                let best_ask = top_of_side(&root["asks"], false);
                let mid = match (best_bid, best_ask) {
                    (Some(b), Some(a)) => (b + a) / 2.0,
                    (Some(b), None) => b,
                    (None, Some(a)) => a,
                    (None, None) => return Ok(vec![VenueMessage::Unknown]),
                };
                Ok(vec![price_update(asset_id, mid, best_bid, best_ask)])
            }
            "last_trade_price" => Ok(vec![VenueMessage::Unknown]),
            "subscriptions" => Ok(vec![VenueMessage::Ack]),
            _ => Ok(vec![VenueMessage::Unknown]),
        }
    }
}

/// Decimal probability → normalized cent update.
fn price_update(
    asset_id: &str,
    decimal: f64,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
) -> VenueMessage {
    let best_bid = best_bid.map(|b| b * 100.0);
    let best_ask = best_ask.map(|a| a * 100.0);
    let spread = match (best_bid, best_ask) {
        (Some(b), Some(a)) => Some(a - b),
        _ => None,
    };
    VenueMessage::Price(PriceUpdate {
        key: PriceKey::new(Venue::Polymarket, asset_id, Outcome::Yes),
        price_cents: decimal * 100.0,
        implied: round_implied(decimal),
        source: PriceSource::Stream,
        observed_at_ms: now_ms(),
        best_bid,
        best_ask,
        spread,
        decimal_odds: None,
    })
}

/// Numbers arrive as JSON strings ("0.55") or plain numbers.
fn decimal_field(root: &serde_json::Value, field: &str) -> Option<f64> {
    let v = &root[field];
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// Best level of one book side: highest bid or lowest ask.
fn top_of_side(side: &serde_json::Value, is_bid: bool) -> Option<f64> {
    let levels = side.as_array()?;
    let mut best: Option<f64> = None;
    for level in levels {
        let price = level["price"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| level["price"].as_f64())?;
        best = Some(match best {
            None => price,
            Some(b) if is_bid => b.max(price),
            Some(b) => b.min(price),
        });
    }
    best
}
