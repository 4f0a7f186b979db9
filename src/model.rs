//! Core domain types shared across the cache, store, codec, and API layers.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Canonical symbol form, e.g. `"BTC/USDT"`. The codec owns the bijection
/// between this form and whatever the upstream exchange calls it on the wire.
pub type Symbol = String;

/// Closed set of supported candlestick granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Timeframe::M1),
            "5m" => Some(Timeframe::M5),
            "15m" => Some(Timeframe::M15),
            "1h" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            "1d" => Some(Timeframe::D1),
            _ => None,
        }
    }

    pub fn duration_secs(self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 5 * 60,
            Timeframe::M15 => 15 * 60,
            Timeframe::H1 => 60 * 60,
            Timeframe::H4 => 4 * 60 * 60,
            Timeframe::D1 => 24 * 60 * 60,
        }
    }

    /// Floor `ts` down to the start of the bucket it falls in.
    pub fn bucket_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.duration_secs();
        let epoch = ts.timestamp();
        let floored = epoch.div_euclid(secs) * secs;
        Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
    }

    pub fn bucket_end(self, bucket_start: DateTime<Utc>) -> DateTime<Utc> {
        bucket_start + ChronoDuration::seconds(self.duration_secs())
    }
}

/// Latest best-bid/ask + last-trade summary for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub last: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume_24h: f64,
    pub change_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub source_ts: DateTime<Utc>,
}

/// A single price/size level on one side of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub size: f64,
}

/// Full order book snapshot for a symbol at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: Symbol,
    /// Sorted descending by price.
    pub bids: Vec<OrderBookLevel>,
    /// Sorted ascending by price.
    pub asks: Vec<OrderBookLevel>,
    pub updated_at: DateTime<Utc>,
    pub sequence: u64,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<OrderBookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<OrderBookLevel> {
        self.asks.first().copied()
    }

    /// A crossed book (best bid >= best ask) indicates upstream or local
    /// reconciliation corruption and should never be served as-is.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }
}

/// One OHLCV candlestick for a symbol/timeframe bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub bucket_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
}

/// Which of the two streamed channels a subscription targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Ticker,
    Orderbook,
}

/// A live subscription: at most one per `(channel, symbol)` pair is active
/// at any time, enforced by [`crate::registry::SubscriptionRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub channel: Channel,
    pub symbol: Symbol,
    /// Requested order book depth; ignored for ticker subscriptions.
    pub depth: Option<u32>,
}
