//! Upstream wire codec.
//!
//! This module is the single authority on the upstream JSON frame layout.
//! Every other module speaks only in terms of [`Event`], [`Channel`] and
//! [`Subscription`] — nothing downstream of here ever touches a raw frame
//! or an exchange-native symbol string.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;

use crate::model::{Channel, OrderBookLevel, Subscription, Symbol};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

/// A decoded, fully-normalized upstream event.
#[derive(Debug, Clone)]
pub enum Event {
    TickerUpdate(TickerUpdate),
    BookSnapshot(BookSnapshotEvent),
    BookDelta(BookDeltaEvent),
    Heartbeat,
    SubscribeAck { channel: Channel, symbol: Symbol },
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct TickerUpdate {
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

#[derive(Debug, Clone)]
pub struct BookSnapshotEvent {
    pub symbol: Symbol,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub sequence: u64,
    pub source_ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BookDeltaEvent {
    pub symbol: Symbol,
    /// Level updates; a size of `0.0` means "remove this price level".
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub sequence: u64,
    pub source_ts: DateTime<Utc>,
}

// =============================================================================
// WIRE FORMAT
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireFrame {
    Ticker {
        symbol: String,
        last: String,
        #[serde(default)]
        bid: Option<String>,
        #[serde(default)]
        ask: Option<String>,
        #[serde(default)]
        volume: String,
        #[serde(default)]
        change: String,
        #[serde(default)]
        high: String,
        #[serde(default)]
        low: String,
        ts: i64,
    },
    Snapshot {
        symbol: String,
        bids: Vec<(String, String)>,
        asks: Vec<(String, String)>,
        #[serde(default)]
        seq: Option<u64>,
        ts: i64,
    },
    Delta {
        symbol: String,
        #[serde(default)]
        bids: Vec<(String, String)>,
        #[serde(default)]
        asks: Vec<(String, String)>,
        #[serde(default)]
        seq: Option<u64>,
        ts: i64,
    },
    Heartbeat {},
    Subscribed {
        channel: String,
        symbol: String,
    },
    Error {
        message: String,
    },
}

fn parse_f64(s: &str) -> Result<f64, CodecError> {
    s.parse()
        .map_err(|_| CodecError::Malformed(format!("not a number: {s}")))
}

fn parse_levels(raw: &[(String, String)]) -> Result<Vec<OrderBookLevel>, CodecError> {
    raw.iter()
        .map(|(p, s)| {
            Ok(OrderBookLevel {
                price: parse_f64(p)?,
                size: parse_f64(s)?,
            })
        })
        .collect()
}

fn parse_ts(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

/// Translates between the upstream wire format and the service's internal
/// [`Event`]/[`Subscription`] vocabulary.
///
/// Owns the exchange-native <-> canonical symbol table and assigns a
/// synthetic, monotonically increasing sequence number to book frames when
/// the upstream omits one. A synthetic counter wrapping back to `1` is
/// indistinguishable from (and downstream is treated identically to) a
/// genuine sequence reset: the book-apply step in the ingest pipeline sees
/// a non-contiguous sequence either way and forces a resnapshot.
pub struct Codec {
    exchange_to_canonical: HashMap<String, Symbol>,
    canonical_to_exchange: HashMap<Symbol, String>,
    synthetic_seq: Mutex<HashMap<Symbol, u64>>,
}

impl Codec {
    pub fn new(pairs: impl IntoIterator<Item = (String, Symbol)>) -> Self {
        let mut exchange_to_canonical = HashMap::new();
        let mut canonical_to_exchange = HashMap::new();
        for (exch, canon) in pairs {
            canonical_to_exchange.insert(canon.clone(), exch.clone());
            exchange_to_canonical.insert(exch, canon);
        }
        Self {
            exchange_to_canonical,
            canonical_to_exchange,
            synthetic_seq: Mutex::new(HashMap::new()),
        }
    }

    /// Canonical form for an exchange-native symbol. Falls back to the raw
    /// upstream spelling, upper-cased, for symbols not in the static table
    /// so that new listings don't hard-fail decoding.
    pub fn to_canonical(&self, exch: &str) -> Symbol {
        self.exchange_to_canonical
            .get(exch)
            .cloned()
            .unwrap_or_else(|| exch.to_uppercase())
    }

    pub fn to_exchange(&self, canon: &Symbol) -> String {
        self.canonical_to_exchange
            .get(canon)
            .cloned()
            .unwrap_or_else(|| canon.replace('/', ""))
    }

    fn next_synthetic_seq(&self, symbol: &Symbol) -> u64 {
        let mut table = self.synthetic_seq.lock();
        let counter = table.entry(symbol.clone()).or_insert(0);
        *counter = counter.wrapping_add(1);
        if *counter == 0 {
            *counter = 1;
        }
        *counter
    }

    pub fn decode(&self, frame: &str) -> Result<Event, CodecError> {
        let wire: WireFrame = serde_json::from_str(frame)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;

        Ok(match wire {
            WireFrame::Ticker {
                symbol,
                last,
                bid,
                ask,
                volume,
                change,
                high,
                low,
                ts,
            } => Event::TickerUpdate(TickerUpdate {
                symbol: self.to_canonical(&symbol),
                last: parse_f64(&last)?,
                bid: bid.as_deref().map(parse_f64).transpose()?,
                ask: ask.as_deref().map(parse_f64).transpose()?,
                volume_24h: if volume.is_empty() { 0.0 } else { parse_f64(&volume)? },
                change_24h: if change.is_empty() { 0.0 } else { parse_f64(&change)? },
                high_24h: if high.is_empty() { 0.0 } else { parse_f64(&high)? },
                low_24h: if low.is_empty() { 0.0 } else { parse_f64(&low)? },
                source_ts: parse_ts(ts),
            }),
            WireFrame::Snapshot {
                symbol,
                bids,
                asks,
                seq,
                ts,
            } => {
                let canon = self.to_canonical(&symbol);
                let sequence = seq.unwrap_or_else(|| self.next_synthetic_seq(&canon));
                Event::BookSnapshot(BookSnapshotEvent {
                    symbol: canon,
                    bids: parse_levels(&bids)?,
                    asks: parse_levels(&asks)?,
                    sequence,
                    source_ts: parse_ts(ts),
                })
            }
            WireFrame::Delta {
                symbol,
                bids,
                asks,
                seq,
                ts,
            } => {
                let canon = self.to_canonical(&symbol);
                let sequence = seq.unwrap_or_else(|| self.next_synthetic_seq(&canon));
                Event::BookDelta(BookDeltaEvent {
                    symbol: canon,
                    bids: parse_levels(&bids)?,
                    asks: parse_levels(&asks)?,
                    sequence,
                    source_ts: parse_ts(ts),
                })
            }
            WireFrame::Heartbeat {} => Event::Heartbeat,
            WireFrame::Subscribed { channel, symbol } => Event::SubscribeAck {
                channel: if channel == "orderbook" {
                    Channel::Orderbook
                } else {
                    Channel::Ticker
                },
                symbol: self.to_canonical(&symbol),
            },
            WireFrame::Error { message } => Event::Error { message },
        })
    }

    fn channel_str(channel: Channel) -> &'static str {
        match channel {
            Channel::Ticker => "ticker",
            Channel::Orderbook => "orderbook",
        }
    }

    pub fn encode_subscribe(&self, subs: &[Subscription]) -> String {
        let channels: Vec<_> = subs
            .iter()
            .map(|s| {
                serde_json::json!({
                    "channel": Self::channel_str(s.channel),
                    "symbol": self.to_exchange(&s.symbol),
                    "depth": s.depth,
                })
            })
            .collect();
        serde_json::json!({ "type": "subscribe", "channels": channels }).to_string()
    }

    pub fn encode_unsubscribe(&self, subs: &[Subscription]) -> String {
        let channels: Vec<_> = subs
            .iter()
            .map(|s| {
                serde_json::json!({
                    "channel": Self::channel_str(s.channel),
                    "symbol": self.to_exchange(&s.symbol),
                })
            })
            .collect();
        serde_json::json!({ "type": "unsubscribe", "channels": channels }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::new([("BTCUSDT".to_string(), "BTC/USDT".to_string())])
    }

    #[test]
    fn decodes_ticker_frame() {
        let frame = r#"{"type":"ticker","symbol":"BTCUSDT","last":"50000.5","bid":"50000","ask":"50001","volume":"123.4","change":"1.2","high":"51000","low":"49000","ts":1690000000000}"#;
        match codec().decode(frame).unwrap() {
            Event::TickerUpdate(t) => {
                assert_eq!(t.symbol, "BTC/USDT");
                assert_eq!(t.last, 50000.5);
                assert_eq!(t.bid, Some(50000.0));
            }
            other => panic!("expected ticker update, got {other:?}"),
        }
    }

    #[test]
    fn decodes_snapshot_and_assigns_synthetic_sequence_when_absent() {
        let frame = r#"{"type":"snapshot","symbol":"BTCUSDT","bids":[["100","1"]],"asks":[["101","2"]],"ts":1690000000000}"#;
        let c = codec();
        let first = match c.decode(frame).unwrap() {
            Event::BookSnapshot(s) => s.sequence,
            _ => panic!("expected snapshot"),
        };
        let second = match c.decode(frame).unwrap() {
            Event::BookSnapshot(s) => s.sequence,
            _ => panic!("expected snapshot"),
        };
        assert_eq!(second, first + 1);
    }

    #[test]
    fn unknown_symbol_falls_back_to_uppercased_raw_spelling() {
        let c = codec();
        assert_eq!(c.to_canonical("ethusdt"), "ETHUSDT");
    }

    #[test]
    fn rejects_malformed_numeric_field() {
        let frame = r#"{"type":"ticker","symbol":"BTCUSDT","last":"not-a-number","volume":"0","change":"0","high":"0","low":"0","ts":0}"#;
        assert!(codec().decode(frame).is_err());
    }

    #[test]
    fn encode_subscribe_round_trips_exchange_symbol() {
        let c = codec();
        let subs = vec![Subscription {
            channel: Channel::Ticker,
            symbol: "BTC/USDT".to_string(),
            depth: None,
        }];
        let encoded = c.encode_subscribe(&subs);
        assert!(encoded.contains("BTCUSDT"));
        assert!(encoded.contains("subscribe"));
    }
}
