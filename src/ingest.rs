//! Ingest pipeline: folds decoded upstream events into the state cache and
//! OHLCV store, and republishes the resulting state changes on the event
//! bus. Runs as its own task, consuming from the channel the connection
//! manager forwards decoded frames on.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::bus::{BusEvent, EventBus};
use crate::cache::{DeltaOutcome, StateCache};
use crate::codec::{BookDeltaEvent, BookSnapshotEvent, Event, TickerUpdate};
use crate::connection::ConnectionHandle;
use crate::model::{Candle, Channel, OrderBook, Subscription, Symbol, Ticker, Timeframe};
use crate::store::OhlcvStore;

/// Folds raw ticker samples into per-timeframe candles and applies book
/// snapshots/deltas to the state cache, forcing a resnapshot whenever
/// continuity can't be established.
pub struct IngestPipeline {
    cache: Arc<StateCache>,
    store: Arc<OhlcvStore>,
    bus: Arc<EventBus>,
    connection: ConnectionHandle,
    open_candles: Mutex<HashMap<(Symbol, Timeframe), Candle>>,
}

impl IngestPipeline {
    pub fn new(
        cache: Arc<StateCache>,
        store: Arc<OhlcvStore>,
        bus: Arc<EventBus>,
        connection: ConnectionHandle,
    ) -> Self {
        Self {
            cache,
            store,
            bus,
            connection,
            open_candles: Mutex::new(HashMap::new()),
        }
    }

    /// Drain `events` until the channel closes (connection manager shut down).
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
    }

    /// Drives the pipeline directly with a decoded event, bypassing the
    /// connection manager. Used by integration tests that have no live
    /// upstream to decode from.
    pub async fn handle_for_test(&self, event: Event) {
        self.handle(event).await;
    }

    async fn handle(&self, event: Event) {
        match event {
            Event::TickerUpdate(t) => self.handle_ticker(t).await,
            Event::BookSnapshot(s) => self.handle_snapshot(s).await,
            Event::BookDelta(d) => self.handle_delta(d).await,
            Event::Heartbeat => trace!("heartbeat"),
            Event::SubscribeAck { channel, symbol } => {
                debug!(?channel, %symbol, "subscribe_ack");
            }
            Event::Error { message } => warn!(%message, "upstream_error"),
        }
    }

    async fn handle_ticker(&self, t: TickerUpdate) {
        if let (Some(bid), Some(ask)) = (t.bid, t.ask) {
            if !(bid <= t.last && t.last <= ask) {
                warn!(
                    symbol = %t.symbol,
                    bid,
                    last = t.last,
                    ask,
                    "ticker_invariant_violation_bid_last_ask"
                );
            }
        }

        let ticker = Ticker {
            symbol: t.symbol.clone(),
            last: t.last,
            bid: t.bid,
            ask: t.ask,
            volume_24h: t.volume_24h,
            change_24h: t.change_24h,
            high_24h: t.high_24h,
            low_24h: t.low_24h,
            source_ts: t.source_ts,
        };
        self.cache.upsert_ticker(ticker.clone());
        self.bus.publish(BusEvent::TickerChanged(ticker)).await;
        self.fold_candles(&t.symbol, t.last, t.volume_24h, t.source_ts).await;
    }

    /// Update (or seal and reopen) the open candle for every supported
    /// timeframe. A sealed candle is persisted as a non-authoritative write
    /// (a later backfill of the same bucket always wins).
    async fn fold_candles(&self, symbol: &Symbol, price: f64, volume: f64, ts: DateTime<Utc>) {
        let mut sealed = Vec::new();
        {
            let mut open = self.open_candles.lock();
            for tf in Timeframe::ALL {
                let bucket = tf.bucket_start(ts);
                let key = (symbol.clone(), tf);
                match open.get_mut(&key) {
                    Some(candle) if candle.bucket_start == bucket => {
                        candle.high = candle.high.max(price);
                        candle.low = candle.low.min(price);
                        candle.close = price;
                        candle.volume = volume;
                        candle.trade_count += 1;
                    }
                    Some(candle) => {
                        sealed.push(candle.clone());
                        *candle = Candle {
                            symbol: symbol.clone(),
                            timeframe: tf,
                            bucket_start: bucket,
                            open: price,
                            high: price,
                            low: price,
                            close: price,
                            volume,
                            trade_count: 1,
                        };
                    }
                    None => {
                        open.insert(
                            key,
                            Candle {
                                symbol: symbol.clone(),
                                timeframe: tf,
                                bucket_start: bucket,
                                open: price,
                                high: price,
                                low: price,
                                close: price,
                                volume,
                                trade_count: 1,
                            },
                        );
                    }
                }
            }
        }

        if !sealed.is_empty() {
            if let Err(e) = self.store.upsert(&sealed, false).await {
                warn!(%symbol, error = %e, "candle_seal_persist_failed");
            }
        }
    }

    async fn handle_snapshot(&self, s: BookSnapshotEvent) {
        let book = OrderBook {
            symbol: s.symbol.clone(),
            bids: s.bids,
            asks: s.asks,
            updated_at: s.source_ts,
            sequence: s.sequence,
        };
        if book.is_crossed() {
            warn!(symbol = %s.symbol, "crossed_book_snapshot_rejected");
            return;
        }
        self.cache.replace_book(book.clone());
        self.bus.publish(BusEvent::BookReplaced(book)).await;
    }

    async fn handle_delta(&self, d: BookDeltaEvent) {
        match self.cache.apply_book_delta(&d.symbol, &d.bids, &d.asks, d.sequence) {
            DeltaOutcome::Applied(book) if book.is_crossed() => {
                warn!(symbol = %d.symbol, "crossed_book_after_delta_forcing_resnapshot");
                self.force_resnapshot(&d.symbol);
            }
            DeltaOutcome::Applied(book) => {
                self.bus.publish(BusEvent::BookChanged(book)).await;
            }
            DeltaOutcome::SequenceGap { expected, got } => {
                warn!(symbol = %d.symbol, expected, got, "sequence_gap_forcing_resnapshot");
                self.force_resnapshot(&d.symbol);
            }
            DeltaOutcome::NoSnapshot => {
                debug!(symbol = %d.symbol, "delta_without_snapshot_forcing_resnapshot");
                self.force_resnapshot(&d.symbol);
            }
        }
    }

    /// Drop the stale cached book and force upstream to resend a fresh
    /// snapshot by cycling the subscription.
    fn force_resnapshot(&self, symbol: &Symbol) {
        self.cache.remove_book(symbol);
        self.connection.notify_unsubscribe(Channel::Orderbook, symbol.clone());
        self.connection.notify_subscribe(Subscription {
            channel: Channel::Orderbook,
            symbol: symbol.clone(),
            depth: None,
        });
    }

    /// Seal every open per-timeframe candle at its last observed price and
    /// persist the result, without reopening a new bucket. Called on
    /// shutdown so no in-progress candle is lost.
    pub async fn flush(&self) {
        let sealed: Vec<Candle> = self.open_candles.lock().drain().map(|(_, candle)| candle).collect();
        if sealed.is_empty() {
            return;
        }
        let count = sealed.len();
        if let Err(e) = self.store.upsert(&sealed, false).await {
            warn!(error = %e, "candle_flush_persist_failed");
        } else {
            debug!(count, "candles_flushed_on_shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::connection::{ConnectionConfig, ConnectionManager};
    use crate::model::OrderBookLevel;
    use crate::registry::SubscriptionRegistry;
    use std::time::Duration;

    fn test_pipeline() -> (Arc<IngestPipeline>, Arc<StateCache>) {
        let cache = Arc::new(StateCache::new());
        let store = Arc::new(OhlcvStore::open(":memory:").unwrap());
        let bus = Arc::new(EventBus::new(64, crate::bus::OverflowPolicy::DropOldest));
        let registry = Arc::new(SubscriptionRegistry::new(vec![]));
        let codec = Arc::new(Codec::new([]));
        let (event_tx, event_rx) = mpsc::channel(64);
        drop(event_rx);
        let (_manager, handle) = ConnectionManager::new(
            ConnectionConfig {
                ws_url: "wss://example.invalid".to_string(),
                reconnect_base_delay: Duration::from_millis(1),
                reconnect_cap_delay: Duration::from_millis(10),
                reconnect_max_attempts: 1,
                heartbeat_interval: Duration::from_secs(30),
                heartbeat_miss_multiplier: 2,
            },
            registry,
            codec,
            event_tx,
        );
        let pipeline = Arc::new(IngestPipeline::new(cache.clone(), store, bus, handle));
        (pipeline, cache)
    }

    #[tokio::test]
    async fn ticker_update_populates_cache() {
        let (pipeline, cache) = test_pipeline();
        pipeline
            .handle_for_test(Event::TickerUpdate(TickerUpdate {
                symbol: "BTC/USDT".to_string(),
                last: 50_000.0,
                bid: Some(49_999.0),
                ask: Some(50_001.0),
                volume_24h: 10.0,
                change_24h: 1.0,
                high_24h: 51_000.0,
                low_24h: 49_000.0,
                source_ts: Utc::now(),
            }))
            .await;

        let ticker = cache.get_ticker("BTC/USDT").unwrap();
        assert_eq!(ticker.last, 50_000.0);
    }

    #[tokio::test]
    async fn snapshot_then_continuous_delta_applies() {
        let (pipeline, cache) = test_pipeline();
        pipeline
            .handle_for_test(Event::BookSnapshot(BookSnapshotEvent {
                symbol: "BTC/USDT".to_string(),
                bids: vec![OrderBookLevel { price: 100.0, size: 1.0 }],
                asks: vec![OrderBookLevel { price: 101.0, size: 1.0 }],
                sequence: 1,
                source_ts: Utc::now(),
            }))
            .await;
        pipeline
            .handle_for_test(Event::BookDelta(BookDeltaEvent {
                symbol: "BTC/USDT".to_string(),
                bids: vec![OrderBookLevel { price: 100.0, size: 2.0 }],
                asks: vec![],
                sequence: 2,
                source_ts: Utc::now(),
            }))
            .await;

        let book = cache.get_book("BTC/USDT").unwrap();
        assert_eq!(book.sequence, 2);
        assert_eq!(book.bids[0].size, 2.0);
    }

    #[tokio::test]
    async fn delta_gap_drops_cached_book() {
        let (pipeline, cache) = test_pipeline();
        pipeline
            .handle_for_test(Event::BookSnapshot(BookSnapshotEvent {
                symbol: "BTC/USDT".to_string(),
                bids: vec![],
                asks: vec![],
                sequence: 1,
                source_ts: Utc::now(),
            }))
            .await;
        pipeline
            .handle_for_test(Event::BookDelta(BookDeltaEvent {
                symbol: "BTC/USDT".to_string(),
                bids: vec![],
                asks: vec![],
                sequence: 5,
                source_ts: Utc::now(),
            }))
            .await;

        assert!(cache.get_book("BTC/USDT").is_none());
    }
}
