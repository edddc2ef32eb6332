//! Shared model types: venue identity, canonical book updates, health
//! records, process configuration, and the client/server wire frames.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Identity tag for a supported venue. Used as a map key and as the
/// `exchange` label in outbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Venue {
    Binance,
    BinanceFutures,
    Bybit,
    Okx,
    Kraken,
    Coinbase,
    Gate,
    Bitstamp,
    Hyperliquid,
}

impl Venue {
    pub const ALL: [Venue; 9] = [
        Venue::Binance,
        Venue::BinanceFutures,
        Venue::Bybit,
        Venue::Okx,
        Venue::Kraken,
        Venue::Coinbase,
        Venue::Gate,
        Venue::Bitstamp,
        Venue::Hyperliquid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Binance => "binance",
            Venue::BinanceFutures => "binance-futures",
            Venue::Bybit => "bybit",
            Venue::Okx => "okx",
            Venue::Kraken => "kraken",
            Venue::Coinbase => "coinbase",
            Venue::Gate => "gate",
            Venue::Bitstamp => "bitstamp",
            Venue::Hyperliquid => "hyperliquid",
        }
    }

    pub fn parse(s: &str) -> Option<Venue> {
        Venue::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `(price, quantity)` level. Zero quantity means delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Full book state at a sequence point, as delivered by a venue.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub venue: Venue,
    pub symbol: String,
    /// Zero for venues whose stream is timestamp-sequenced.
    pub last_update_id: u64,
    /// Ordered by price descending.
    pub bids: Vec<PriceLevel>,
    /// Ordered by price ascending.
    pub asks: Vec<PriceLevel>,
    pub observed_at: DateTime<Utc>,
}

/// Canonical incremental update. When `is_snapshot` is set, the update
/// replaces the book instead of patching it.
#[derive(Debug, Clone)]
pub struct DepthUpdate {
    pub venue: Venue,
    pub symbol: String,
    pub event_time: DateTime<Utc>,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub prev_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub is_snapshot: bool,
}

impl DepthUpdate {
    /// True when the venue's protocol exposes sequence ids on this update.
    pub fn has_sequencing(&self) -> bool {
        self.final_update_id != 0
    }
}

/// Point-in-time view of a connector's health counters.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub connected: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub error_count: u64,
    pub last_reconnect_at: Option<DateTime<Utc>>,
}

/// One row of a top-N depth view: a level plus the running quantity sum
/// from the top of that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelView {
    pub price: Decimal,
    pub quantity: Decimal,
    pub cumulative: Decimal,
}

/// Top-N extract of one book, both sides.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DepthView {
    pub bids: Vec<LevelView>,
    pub asks: Vec<LevelView>,
}

/// Statistics record computed from one book. Serialized field names match
/// the outbound frame contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsRecord {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub mid_price: Decimal,
    pub spread: Decimal,
    pub bid_liquidity_05_pct: Decimal,
    pub ask_liquidity_05_pct: Decimal,
    pub delta_liquidity_05_pct: Decimal,
    pub bid_liquidity_2_pct: Decimal,
    pub ask_liquidity_2_pct: Decimal,
    pub delta_liquidity_2_pct: Decimal,
    pub bid_liquidity_10_pct: Decimal,
    pub ask_liquidity_10_pct: Decimal,
    pub delta_liquidity_10_pct: Decimal,
    pub total_bids_qty: Decimal,
    pub total_asks_qty: Decimal,
    pub total_delta: Decimal,
}

/// Server-to-client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Orderbook {
        exchange: &'static str,
        bids: Vec<LevelView>,
        asks: Vec<LevelView>,
    },
    Stats {
        exchange: &'static str,
        #[serde(flatten)]
        record: StatsRecord,
    },
}

/// Client-to-server control frames. Anything that fails to parse into one
/// of these is logged and ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    SetTick { tick: Decimal },
    ChangeSymbol { symbol: String },
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub symbol: String,
    pub port: u16,
    pub venues: Vec<Venue>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let symbol = std::env::var("SYMBOL")
            .unwrap_or_else(|_| "BTCUSDT".to_string())
            .trim()
            .to_uppercase();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let venues = match std::env::var("VENUES") {
            Ok(raw) => {
                let parsed: Vec<Venue> = raw.split(',').filter_map(Venue::parse).collect();
                if parsed.is_empty() {
                    Venue::ALL.to_vec()
                } else {
                    parsed
                }
            }
            Err(_) => Venue::ALL.to_vec(),
        };

        Self {
            symbol,
            port,
            venues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn venue_tags_round_trip() {
        for venue in Venue::ALL {
            assert_eq!(Venue::parse(venue.as_str()), Some(venue));
        }
        assert_eq!(Venue::parse("BINANCE"), Some(Venue::Binance));
        assert_eq!(Venue::parse("no-such-venue"), None);
    }

    #[test]
    fn orderbook_frame_shape() {
        let frame = ServerFrame::Orderbook {
            exchange: Venue::Binance.as_str(),
            bids: vec![LevelView {
                price: dec!(100),
                quantity: dec!(2),
                cumulative: dec!(2),
            }],
            asks: vec![],
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "orderbook");
        assert_eq!(json["exchange"], "binance");
        assert_eq!(json["bids"][0]["price"], "100");
        assert_eq!(json["bids"][0]["cumulative"], "2");
    }

    #[test]
    fn stats_frame_uses_camel_case_decimal_strings() {
        let record = StatsRecord {
            best_bid: dec!(100),
            best_ask: dec!(101),
            mid_price: dec!(100.5),
            spread: dec!(1),
            bid_liquidity_05_pct: dec!(2),
            ask_liquidity_05_pct: dec!(3),
            delta_liquidity_05_pct: dec!(-1),
            bid_liquidity_2_pct: dec!(2),
            ask_liquidity_2_pct: dec!(3),
            delta_liquidity_2_pct: dec!(-1),
            bid_liquidity_10_pct: dec!(2),
            ask_liquidity_10_pct: dec!(3),
            delta_liquidity_10_pct: dec!(-1),
            total_bids_qty: dec!(5),
            total_asks_qty: dec!(4),
            total_delta: dec!(1),
        };
        let json = serde_json::to_value(ServerFrame::Stats {
            exchange: Venue::Kraken.as_str(),
            record,
        })
        .unwrap();
        assert_eq!(json["type"], "stats");
        assert_eq!(json["bestBid"], "100");
        assert_eq!(json["midPrice"], "100.5");
        assert_eq!(json["bidLiquidity05Pct"], "2");
        assert_eq!(json["deltaLiquidity10Pct"], "-1");
        assert_eq!(json["totalDelta"], "1");
    }

    #[test]
    fn client_frames_parse() {
        let set_tick: ClientFrame =
            serde_json::from_str(r#"{"type":"set_tick","tick":0.5}"#).unwrap();
        assert!(matches!(set_tick, ClientFrame::SetTick { tick } if tick == dec!(0.5)));

        let change: ClientFrame =
            serde_json::from_str(r#"{"type":"change_symbol","symbol":"ETHUSDT"}"#).unwrap();
        assert!(matches!(change, ClientFrame::ChangeSymbol { symbol } if symbol == "ETHUSDT"));

        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"bogus"}"#).is_err());
    }
}
