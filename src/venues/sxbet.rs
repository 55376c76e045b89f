// =============================================================================
// SX Bet stream protocol — sportsbook venue quoting fixed-point implied odds
// =============================================================================
//
// Maker odds arrive as an integer-valued implied probability scaled by 10^20.
// The taker's decimal odds are 1 / (1 − makerImplied), clamped to ≥ 1.01,
// and the stored implied probability is the taker cost 1 / decimalOdds.
//
// The two sides of a sportsbook market are explicit, independently priced
// legs; the cache never derives one from the other.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};

use crate::types::{now_ms, round_implied, Outcome, PriceKey, PriceSource, PriceUpdate, Venue};

use super::{VenueMessage, VenueProtocol};

const DEFAULT_WS_URL: &str = "wss://api.sx.bet/ws";

/// Scale factor of the venue's fixed-point implied probability.
const ODDS_SCALE: f64 = 1e20;

/// Floor for taker decimal odds.
const MIN_DECIMAL_ODDS: f64 = 1.01;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(15);

pub struct SxBetProtocol {
    url: String,
    api_key: String,
}

impl SxBetProtocol {
    /// Build from environment. `None` (→ DISABLED client) when the API key
    /// is absent.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("SXBET_API_KEY").ok()?;
        if api_key.trim().is_empty() {
            return None;
        }
        let url = std::env::var("SXBET_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());
        Some(Self { url, api_key })
    }

    pub fn with_url(url: String, api_key: String) -> Self {
        Self { url, api_key }
    }
}

impl VenueProtocol for SxBetProtocol {
    fn venue(&self) -> Venue {
        Venue::SxBet
    }

    fn ws_url(&self) -> &str {
        &self.url
    }

    fn subscribe_frames(&self, ids: &[String]) -> Vec<String> {
        vec![serde_json::json!({
            "type": "subscribe",
            "channel": "market_odds",
            "markets": ids,
            "apiKey": self.api_key,
        })
        .to_string()]
    }

    fn unsubscribe_frames(&self, ids: &[String]) -> Vec<String> {
        vec![serde_json::json!({
            "type": "unsubscribe",
            "channel": "market_odds",
            "markets": ids,
        })
        .to_string()]
    }

    fn heartbeat(&self) -> Option<(String, Duration)> {
        Some((
            serde_json::json!({"type": "ping"}).to_string(),
            HEARTBEAT_PERIOD,
        ))
    }

    fn parse(&self, text: &str) -> Result<Vec<VenueMessage>> {
        let root: serde_json::Value =
            serde_json::from_str(text).context("sxbet message is not JSON")?;

        match root["type"].as_str().unwrap_or("") {
            "market_odds" => {
                let market = root["marketHash"]
                    .as_str()
                    .context("market_odds missing marketHash")?;
                let outcome = match root["outcome"].as_u64() {
                    Some(1) => Outcome::Yes,
                    Some(2) => Outcome::No,
                    _ => anyhow::bail!("market_odds has invalid outcome"),
                };
                let raw: f64 = root["percentageOdds"]
                    .as_str()
                    .context("market_odds missing percentageOdds")?
                    .parse()
                    .context("percentageOdds is not numeric")?;

                let maker_implied = (raw / ODDS_SCALE).clamp(0.0, 1.0);
                let decimal_odds = taker_decimal_odds(maker_implied);
                let implied = round_implied(1.0 / decimal_odds);

                Ok(vec![VenueMessage::Price(PriceUpdate {
                    key: PriceKey::new(Venue::SxBet, market, outcome),
                    price_cents: implied * 100.0,
                    implied,
                    source: PriceSource::Stream,
                    observed_at_ms: now_ms(),
                    best_bid: None,
                    best_ask: None,
                    spread: None,
                    decimal_odds: Some(decimal_odds),
                })])
            }
            "score_update" => Ok(vec![VenueMessage::Score]),
            "subscribed" | "unsubscribed" => Ok(vec![VenueMessage::Ack]),
            "pong" => Ok(vec![VenueMessage::HeartbeatEcho]),
            _ => Ok(vec![VenueMessage::Unknown]),
        }
    }
}

/// Taker decimal odds for a given maker implied probability.
fn taker_decimal_odds(maker_implied: f64) -> f64 {
    if maker_implied >= 1.0 {
        return MIN_DECIMAL_ODDS;
    }
    (1.0 / (1.0 - maker_implied)).max(MIN_DECIMAL_ODDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> SxBetProtocol {
        SxBetProtocol::with_url("wss://example.invalid".to_string(), "key".to_string())
    }

    fn price_of(messages: Vec<VenueMessage>) -> PriceUpdate {
        match messages.into_iter().next().unwrap() {
            VenueMessage::Price(u) => u,
            other => panic!("expected price, got {other:?}"),
        }
    }

    #[test]
    fn fixed_point_odds_convert() {
        // Maker implied 47.5% → taker decimal odds 1/(1-0.475) ≈ 1.9048.
        let text = r#"{"type":"market_odds","marketHash":"0xm1","outcome":1,"percentageOdds":"47500000000000000000"}"#;
        let u = price_of(protocol().parse(text).unwrap());
        let odds = u.decimal_odds.unwrap();
        assert!((odds - 1.904_762).abs() < 1e-6);
        assert!((u.implied - 0.525).abs() < 1e-6);
        assert!((u.price_cents - 52.5).abs() < 1e-4);
        assert_eq!(u.key.outcome, Outcome::Yes);
    }

    #[test]
    fn near_zero_maker_implied_clamps_decimal_odds() {
        let text = r#"{"type":"market_odds","marketHash":"0xm1","outcome":2,"percentageOdds":"0"}"#;
        let u = price_of(protocol().parse(text).unwrap());
        assert_eq!(u.decimal_odds, Some(1.01));
        assert_eq!(u.key.outcome, Outcome::No);
    }

    #[test]
    fn full_maker_implied_clamps_decimal_odds() {
        let text = r#"{"type":"market_odds","marketHash":"0xm1","outcome":1,"percentageOdds":"100000000000000000000"}"#;
        let u = price_of(protocol().parse(text).unwrap());
        assert_eq!(u.decimal_odds, Some(1.01));
    }

    #[test]
    fn score_updates_are_recognized() {
        let text = r#"{"type":"score_update","marketHash":"0xm1","homeScore":2}"#;
        assert!(matches!(
            protocol().parse(text).unwrap()[0],
            VenueMessage::Score
        ));
    }

    #[test]
    fn malformed_messages_error() {
        let p = protocol();
        assert!(p.parse("nope").is_err());
        assert!(p
            .parse(r#"{"type":"market_odds","marketHash":"0xm1","outcome":3,"percentageOdds":"1"}"#)
            .is_err());
        assert!(p
            .parse(r#"{"type":"market_odds","outcome":1,"percentageOdds":"1"}"#)
            .is_err());
    }

    #[test]
    fn heartbeat_is_json_ping() {
        let (payload, period) = protocol().heartbeat().unwrap();
        assert_eq!(payload, r#"{"type":"ping"}"#);
        assert_eq!(period, Duration::from_secs(15));
    }
}
