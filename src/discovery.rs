// =============================================================================
// Market Discovery — REST snapshot fetchers that seed the event registry
// =============================================================================
//
// Each venue exposes a market-listing endpoint; one discovery pass pulls all
// configured venues concurrently and flattens the results into a
// MarketSnapshot for the matcher. A venue whose fetch fails is skipped with a
// warning — the refresh only errors when every configured venue failed, so
// the worker keeps its previous registry.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::types::{MarketKind, MarketSnapshot, Venue, VenueMarket};

/// Deadline for one venue's listing request.
const FETCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub struct DiscoveryClient {
    http: reqwest::Client,
    kalshi_base: Option<String>,
    kalshi_api_key: Option<String>,
    polymarket_base: Option<String>,
    sxbet_base: Option<String>,
}

impl DiscoveryClient {
    /// Build from environment; venues without a configured REST base are
    /// simply absent from snapshots.
    pub fn from_env() -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .expect("failed to build discovery HTTP client");

        Self {
            http,
            kalshi_base: std::env::var("KALSHI_REST_URL").ok(),
            kalshi_api_key: std::env::var("KALSHI_API_KEY").ok(),
            polymarket_base: std::env::var("POLYMARKET_REST_URL").ok(),
            sxbet_base: std::env::var("SXBET_REST_URL").ok(),
        }
    }

    /// One discovery pass across all configured venues.
    pub async fn fetch_snapshot(&self) -> Result<MarketSnapshot> {
        let (kalshi, polymarket, sxbet) = tokio::join!(
            self.fetch_kalshi(),
            self.fetch_polymarket(),
            self.fetch_sxbet()
        );

        let mut markets = Vec::new();
        let mut configured = 0usize;
        let mut failed = 0usize;

        for (venue, result) in [
            (Venue::Kalshi, kalshi),
            (Venue::Polymarket, polymarket),
            (Venue::SxBet, sxbet),
        ] {
            match result {
                Some(Ok(mut venue_markets)) => {
                    configured += 1;
                    debug!(venue = %venue, count = venue_markets.len(), "venue markets fetched");
                    markets.append(&mut venue_markets);
                }
                Some(Err(e)) => {
                    configured += 1;
                    failed += 1;
                    warn!(venue = %venue, error = %e, "venue discovery failed — skipping venue");
                }
                None => {}
            }
        }

        if configured > 0 && failed == configured {
            anyhow::bail!("discovery failed for all {configured} configured venues");
        }

        Ok(MarketSnapshot { markets })
    }

    async fn fetch_kalshi(&self) -> Option<Result<Vec<VenueMarket>>> {
        let base = self.kalshi_base.as_ref()?;
        let url = format!("{base}/trade-api/v2/markets?status=open&limit=1000");
        Some(self.fetch_kalshi_inner(&url).await)
    }

    async fn fetch_kalshi_inner(&self, url: &str) -> Result<Vec<VenueMarket>> {
        let mut request = self.http.get(url);
        if let Some(key) = &self.kalshi_api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        let resp = request.send().await.context("kalshi markets request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse kalshi markets response")?;
        if !status.is_success() {
            anyhow::bail!("kalshi markets returned {status}: {body}");
        }
        Ok(parse_kalshi_markets(&body))
    }

    async fn fetch_polymarket(&self) -> Option<Result<Vec<VenueMarket>>> {
        let base = self.polymarket_base.as_ref()?;
        let url = format!("{base}/markets?active=true&closed=false&limit=1000");
        Some(self.fetch_json(&url, "polymarket").await.map(|v| parse_polymarket_markets(&v)))
    }

    async fn fetch_sxbet(&self) -> Option<Result<Vec<VenueMarket>>> {
        let base = self.sxbet_base.as_ref()?;
        let url = format!("{base}/markets/active");
        Some(self.fetch_json(&url, "sxbet").await.map(|v| parse_sxbet_markets(&v)))
    }

    async fn fetch_json(&self, url: &str, venue: &str) -> Result<serde_json::Value> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("{venue} markets request failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {venue} markets response"))?;
        if !status.is_success() {
            anyhow::bail!("{venue} markets returned {status}: {body}");
        }
        Ok(body)
    }
}

impl std::fmt::Debug for DiscoveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryClient")
            .field("kalshi", &self.kalshi_base.is_some())
            .field("polymarket", &self.polymarket_base.is_some())
            .field("sxbet", &self.sxbet_base.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Per-venue response parsing
// ---------------------------------------------------------------------------

/// Kalshi: cents-quoted prediction markets under a "markets" array.
fn parse_kalshi_markets(body: &serde_json::Value) -> Vec<VenueMarket> {
    let Some(rows) = body["markets"].as_array() else {
        return Vec::new();
    };

    let mut markets = Vec::new();
    for row in rows {
        let Some(ticker) = row["ticker"].as_str() else {
            continue;
        };
        let Some(title) = row["title"].as_str() else {
            continue;
        };
        let Some(close_time) = parse_rfc3339(&row["close_time"]) else {
            continue;
        };

        let yes_mid = mid_of(row["yes_bid"].as_f64(), row["yes_ask"].as_f64());
        let no_mid = mid_of(row["no_bid"].as_f64(), row["no_ask"].as_f64())
            .or(yes_mid.map(|y| 100.0 - y));

        markets.push(VenueMarket {
            id: ticker.to_string(),
            venue: Venue::Kalshi,
            kind: MarketKind::Prediction,
            title: title.to_string(),
            home_team: None,
            away_team: None,
            sport: row["category"].as_str().map(|s| s.to_string()),
            start_time: parse_rfc3339(&row["expected_start_time"]),
            close_time,
            yes_price_cents: yes_mid,
            no_price_cents: no_mid,
            yes_decimal_odds: None,
            no_decimal_odds: None,
            liquidity_usd: row["liquidity"].as_f64().unwrap_or(0.0),
            volume_usd: row["volume"].as_f64().unwrap_or(0.0),
        });
    }
    markets
}

/// Polymarket gamma: decimal-quoted markets; numeric arrays arrive as
/// JSON-encoded strings (`"[\"0.55\", \"0.45\"]"`).
fn parse_polymarket_markets(body: &serde_json::Value) -> Vec<VenueMarket> {
    let Some(rows) = body.as_array() else {
        return Vec::new();
    };

    let mut markets = Vec::new();
    for row in rows {
        let Some(token_id) = first_of_encoded_array(&row["clobTokenIds"]) else {
            continue;
        };
        let Some(title) = row["question"].as_str() else {
            continue;
        };
        let Some(close_time) = parse_rfc3339(&row["endDate"]) else {
            continue;
        };

        let prices = decoded_array(&row["outcomePrices"]);
        let yes = prices.first().copied().map(|p| p * 100.0);
        let no = prices.get(1).copied().map(|p| p * 100.0);

        markets.push(VenueMarket {
            id: token_id,
            venue: Venue::Polymarket,
            kind: MarketKind::Prediction,
            title: title.to_string(),
            home_team: None,
            away_team: None,
            sport: row["category"].as_str().map(|s| s.to_string()),
            start_time: parse_rfc3339(&row["gameStartTime"]),
            close_time,
            yes_price_cents: yes,
            no_price_cents: no,
            yes_decimal_odds: None,
            no_decimal_odds: None,
            liquidity_usd: number_or_string(&row["liquidity"]).unwrap_or(0.0),
            volume_usd: number_or_string(&row["volume"]).unwrap_or(0.0),
        });
    }
    markets
}

/// SX Bet: sportsbook matchups; odds only flow on the stream, so listings
/// carry no snapshot prices.
fn parse_sxbet_markets(body: &serde_json::Value) -> Vec<VenueMarket> {
    let Some(rows) = body["data"]["markets"].as_array() else {
        return Vec::new();
    };

    let mut markets = Vec::new();
    for row in rows {
        let Some(hash) = row["marketHash"].as_str() else {
            continue;
        };
        let (Some(home), Some(away)) = (
            row["teamOneName"].as_str(),
            row["teamTwoName"].as_str(),
        ) else {
            continue;
        };
        let Some(game_time) = row["gameTime"].as_i64() else {
            continue;
        };
        let Some(start_time) = Utc.timestamp_opt(game_time, 0).single() else {
            continue;
        };

        markets.push(VenueMarket {
            id: hash.to_string(),
            venue: Venue::SxBet,
            kind: MarketKind::Sportsbook,
            title: format!("{home} vs {away}"),
            home_team: Some(home.to_string()),
            away_team: Some(away.to_string()),
            sport: row["sportLabel"].as_str().map(|s| s.to_string()),
            start_time: Some(start_time),
            // Sportsbook listings stay open through the game.
            close_time: start_time + chrono::Duration::hours(12),
            yes_price_cents: None,
            no_price_cents: None,
            yes_decimal_odds: None,
            no_decimal_odds: None,
            liquidity_usd: 0.0,
            volume_usd: number_or_string(&row["volume"]).unwrap_or(0.0),
        });
    }
    markets
}

fn mid_of(bid: Option<f64>, ask: Option<f64>) -> Option<f64> {
    match (bid, ask) {
        (Some(b), Some(a)) => Some((b + a) / 2.0),
        (Some(b), None) => Some(b),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

fn parse_rfc3339(v: &serde_json::Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn number_or_string(v: &serde_json::Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// `"[\"0.55\", \"0.45\"]"` → `[0.55, 0.45]`.
fn decoded_array(v: &serde_json::Value) -> Vec<f64> {
    let Some(raw) = v.as_str() else {
        return Vec::new();
    };
    let Ok(parsed) = serde_json::from_str::<Vec<String>>(raw) else {
        return Vec::new();
    };
    parsed.iter().filter_map(|s| s.parse().ok()).collect()
}

fn first_of_encoded_array(v: &serde_json::Value) -> Option<String> {
    let raw = v.as_str()?;
    let parsed: Vec<String> = serde_json::from_str(raw).ok()?;
    parsed.into_iter().next()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kalshi_listing() {
        let body = serde_json::json!({
            "markets": [
                {
                    "ticker": "KX-BTC-70K",
                    "title": "Bitcoin above $70K on Mar 1?",
                    "yes_bid": 54, "yes_ask": 58,
                    "close_time": "2025-03-01T23:59:59Z",
                    "category": "crypto",
                    "liquidity": 125000.0,
                    "volume": 88000.0
                },
                { "ticker": "KX-NO-TITLE" }
            ]
        });
        let markets = parse_kalshi_markets(&body);
        assert_eq!(markets.len(), 1);
        let m = &markets[0];
        assert_eq!(m.id, "KX-BTC-70K");
        assert_eq!(m.yes_price_cents, Some(56.0));
        assert_eq!(m.no_price_cents, Some(44.0));
        assert_eq!(m.kind, MarketKind::Prediction);
    }

    #[test]
    fn parses_polymarket_listing_with_encoded_arrays() {
        let body = serde_json::json!([
            {
                "question": "Will Bitcoin close above $70,000 on March 1?",
                "clobTokenIds": "[\"0xtok1\", \"0xtok2\"]",
                "outcomePrices": "[\"0.55\", \"0.45\"]",
                "endDate": "2025-03-01T23:59:59Z",
                "liquidity": "43210.5",
                "volume": "99000"
            }
        ]);
        let markets = parse_polymarket_markets(&body);
        assert_eq!(markets.len(), 1);
        let m = &markets[0];
        assert_eq!(m.id, "0xtok1");
        assert_eq!(m.yes_price_cents, Some(55.0));
        assert_eq!(m.no_price_cents, Some(45.0));
        assert_eq!(m.liquidity_usd, 43210.5);
    }

    #[test]
    fn parses_sxbet_listing() {
        let body = serde_json::json!({
            "data": { "markets": [
                {
                    "marketHash": "0xm1",
                    "teamOneName": "Los Angeles Lakers",
                    "teamTwoName": "Golden State Warriors",
                    "sportLabel": "Basketball",
                    "gameTime": 1740855600,
                    "volume": 12000.0
                }
            ]}
        });
        let markets = parse_sxbet_markets(&body);
        assert_eq!(markets.len(), 1);
        let m = &markets[0];
        assert_eq!(m.kind, MarketKind::Sportsbook);
        assert_eq!(m.home_team.as_deref(), Some("Los Angeles Lakers"));
        assert!(m.title.contains("vs"));
        assert!(m.yes_price_cents.is_none());
    }

    #[test]
    fn malformed_rows_are_skipped_not_fatal() {
        let body = serde_json::json!({ "markets": [ {"junk": true} ] });
        assert!(parse_kalshi_markets(&body).is_empty());
        assert!(parse_polymarket_markets(&serde_json::json!("nope")).is_empty());
        assert!(parse_sxbet_markets(&serde_json::json!({})).is_empty());
    }
}
