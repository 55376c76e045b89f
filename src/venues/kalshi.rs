// =============================================================================
// Kalshi stream protocol — prediction venue quoting integer cents
// =============================================================================
//
// Orderbook updates carry top-of-book yes_bid/yes_ask in cents. The
// normalized mid is (bid + ask) / 2 when both sides exist, otherwise
// whichever side exists. A ticker's last-trade price is used only when no
// book side is present at all.
// =============================================================================

use anyhow::{Context, Result};

use crate::types::{now_ms, round_implied, Outcome, PriceKey, PriceSource, PriceUpdate, Venue};

use super::{VenueMessage, VenueProtocol};

const DEFAULT_WS_URL: &str = "wss://api.elections.kalshi.com/trade-api/ws/v2";

/// Markets per subscribe frame accepted by the venue.
const BATCH_SIZE: usize = 20;

pub struct KalshiProtocol {
    url: String,
    api_key: String,
}

impl KalshiProtocol {
    /// Build from environment. `None` when the API key is absent — the
    /// worker then runs this venue DISABLED rather than erroring.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("KALSHI_API_KEY").ok()?;
        if api_key.trim().is_empty() {
            return None;
        }
        let url = std::env::var("KALSHI_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());
        Some(Self { url, api_key })
    }

    pub fn with_url(url: String, api_key: String) -> Self {
        Self { url, api_key }
    }
}

impl VenueProtocol for KalshiProtocol {
    fn venue(&self) -> Venue {
        Venue::Kalshi
    }

    fn ws_url(&self) -> &str {
        &self.url
    }

    fn max_batch_size(&self) -> usize {
        BATCH_SIZE
    }

    fn subscribe_frames(&self, ids: &[String]) -> Vec<String> {
        vec![serde_json::json!({
            "id": 1,
            "cmd": "subscribe",
            "params": {
                "channels": ["orderbook_delta", "ticker"],
                "market_tickers": ids,
                "api_key": self.api_key,
            }
        })
        .to_string()]
    }

    fn unsubscribe_frames(&self, ids: &[String]) -> Vec<String> {
        vec![serde_json::json!({
            "id": 2,
            "cmd": "unsubscribe",
            "params": {
                "channels": ["orderbook_delta", "ticker"],
                "market_tickers": ids,
            }
        })
        .to_string()]
    }

    // No application heartbeat; the venue works off transport pings.

    fn parse(&self, text: &str) -> Result<Vec<VenueMessage>> {
        let root: serde_json::Value =
            serde_json::from_str(text).context("kalshi message is not JSON")?;
        let msg_type = root["type"].as_str().unwrap_or("");

        match msg_type {
            "orderbook_delta" | "orderbook_snapshot" | "ticker" => {
                let body = &root["msg"];
                let ticker = body["market_ticker"]
                    .as_str()
                    .context("kalshi message missing market_ticker")?;

                let yes_bid = body["yes_bid"].as_f64();
                let yes_ask = body["yes_ask"].as_f64();
                let last = body["price"].as_f64();

                // Top-of-book beats last trade whenever any side exists.
                let mid = match (yes_bid, yes_ask) {
                    (Some(b), Some(a)) => (b + a) / 2.0,
                    (Some(b), None) => b,
                    (None, Some(a)) => a,
                    (None, None) => match last {
                        Some(p) => p,
                        None => return Ok(vec![VenueMessage::Unknown]),
                    },
                };

                let spread = match (yes_bid, yes_ask) {
                    (Some(b), Some(a)) => Some(a - b),
                    _ => None,
                };

                Ok(vec![VenueMessage::Price(PriceUpdate {
                    key: PriceKey::new(Venue::Kalshi, ticker, Outcome::Yes),
                    price_cents: mid,
                    implied: round_implied(mid / 100.0),
                    source: PriceSource::Stream,
                    observed_at_ms: now_ms(),
                    best_bid: yes_bid,
                    best_ask: yes_ask,
                    spread,
                    decimal_odds: None,
                })])
            }
            "subscribed" | "unsubscribed" | "ok" => Ok(vec![VenueMessage::Ack]),
            "heartbeat" => Ok(vec![VenueMessage::HeartbeatEcho]),
            _ => Ok(vec![VenueMessage::Unknown]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> KalshiProtocol {
        KalshiProtocol::with_url("wss://example.invalid".to_string(), "key".to_string())
    }

    fn price_of(messages: Vec<VenueMessage>) -> PriceUpdate {
        match messages.into_iter().next().unwrap() {
            VenueMessage::Price(u) => u,
            other => panic!("expected price, got {other:?}"),
        }
    }

    #[test]
    fn mid_from_both_sides() {
        let text = r#"{"type":"orderbook_delta","msg":{"market_ticker":"KX-1","yes_bid":54,"yes_ask":58}}"#;
        let u = price_of(protocol().parse(text).unwrap());
        assert_eq!(u.price_cents, 56.0);
        assert_eq!(u.implied, 0.56);
        assert_eq!(u.best_bid, Some(54.0));
        assert_eq!(u.best_ask, Some(58.0));
        assert_eq!(u.spread, Some(4.0));
        assert_eq!(u.key.outcome, Outcome::Yes);
    }

    #[test]
    fn single_side_uses_that_side() {
        let text = r#"{"type":"orderbook_delta","msg":{"market_ticker":"KX-1","yes_bid":54}}"#;
        let u = price_of(protocol().parse(text).unwrap());
        assert_eq!(u.price_cents, 54.0);
        assert!(u.spread.is_none());
    }

    #[test]
    fn last_trade_is_ignored_when_book_exists() {
        let text = r#"{"type":"ticker","msg":{"market_ticker":"KX-1","price":99,"yes_bid":54,"yes_ask":58}}"#;
        let u = price_of(protocol().parse(text).unwrap());
        assert_eq!(u.price_cents, 56.0);
    }

    #[test]
    fn last_trade_used_only_without_book() {
        let text = r#"{"type":"ticker","msg":{"market_ticker":"KX-1","price":61}}"#;
        let u = price_of(protocol().parse(text).unwrap());
        assert_eq!(u.price_cents, 61.0);
    }

    #[test]
    fn control_messages_classify() {
        let p = protocol();
        assert!(matches!(
            p.parse(r#"{"type":"subscribed","id":1}"#).unwrap()[0],
            VenueMessage::Ack
        ));
        assert!(matches!(
            p.parse(r#"{"type":"heartbeat"}"#).unwrap()[0],
            VenueMessage::HeartbeatEcho
        ));
        assert!(matches!(
            p.parse(r#"{"type":"trade_fill"}"#).unwrap()[0],
            VenueMessage::Unknown
        ));
    }

    #[test]
    fn malformed_messages_error() {
        let p = protocol();
        assert!(p.parse("not json").is_err());
        assert!(p
            .parse(r#"{"type":"orderbook_delta","msg":{"yes_bid":54}}"#)
            .is_err());
    }

    #[test]
    fn subscribe_frame_carries_tickers() {
        let frames = protocol().subscribe_frames(&["A".to_string(), "B".to_string()]);
        assert_eq!(frames.len(), 1);
        let v: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["cmd"], "subscribe");
        assert_eq!(v["params"]["market_tickers"][1], "B");
    }
}
