//! End-to-end scenarios exercising the public library surface without a
//! live upstream connection: decoded events are fed directly into the
//! ingest pipeline, and results are observed through the query layer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use marketdata_core::backfill::BackfillEngine;
use marketdata_core::bus::{BusEvent, EventBus, OverflowPolicy};
use marketdata_core::cache::{QueryCache, StateCache};
use marketdata_core::codec::{BookDeltaEvent, BookSnapshotEvent, Codec, Event, TickerUpdate};
use marketdata_core::connection::{ConnectionConfig, ConnectionManager};
use marketdata_core::ingest::IngestPipeline;
use marketdata_core::model::{Channel, OrderBookLevel, Timeframe};
use marketdata_core::query::QueryLayer;
use marketdata_core::registry::SubscriptionRegistry;
use marketdata_core::store::OhlcvStore;

struct Harness {
    pipeline: Arc<IngestPipeline>,
    query: Arc<QueryLayer>,
}

fn build_harness() -> Harness {
    build_harness_with_backfill("http://127.0.0.1:1".to_string(), Duration::from_millis(200), 1)
}

fn build_harness_with_backfill(rest_url: String, page_timeout: Duration, max_retries: u32) -> Harness {
    let cache = Arc::new(StateCache::new());
    let query_cache = Arc::new(QueryCache::new(Duration::from_secs(30)));
    let store = Arc::new(OhlcvStore::open(":memory:").unwrap());
    let bus = Arc::new(EventBus::new(256, OverflowPolicy::DropOldest));
    let registry = Arc::new(SubscriptionRegistry::new(vec![]));
    let codec = Arc::new(Codec::new([("BTCUSDT".to_string(), "BTC/USDT".to_string())]));

    let (event_tx, _event_rx) = mpsc::channel(64);
    let (_manager, connection_handle) = ConnectionManager::new(
        ConnectionConfig {
            ws_url: "wss://example.invalid".to_string(),
            reconnect_base_delay: Duration::from_millis(1),
            reconnect_cap_delay: Duration::from_millis(10),
            reconnect_max_attempts: 1,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_miss_multiplier: 2,
        },
        registry.clone(),
        codec,
        event_tx,
    );

    let pipeline = Arc::new(IngestPipeline::new(
        cache.clone(),
        store.clone(),
        bus.clone(),
        connection_handle.clone(),
    ));

    let backfill = Arc::new(BackfillEngine::new(
        rest_url,
        page_timeout,
        max_retries,
        1,
        Duration::from_secs(1),
        store.clone(),
        query_cache.clone(),
        bus.clone(),
    ));

    let query = Arc::new(QueryLayer::new(
        cache,
        query_cache,
        store,
        registry,
        connection_handle,
        backfill,
        bus,
    ));

    Harness { pipeline, query }
}

fn ticker_event(symbol: &str, last: f64, ts: chrono::DateTime<Utc>) -> Event {
    Event::TickerUpdate(TickerUpdate {
        symbol: symbol.to_string(),
        last,
        bid: Some(last - 1.0),
        ask: Some(last + 1.0),
        volume_24h: 100.0,
        change_24h: 0.5,
        high_24h: last + 10.0,
        low_24h: last - 10.0,
        source_ts: ts,
    })
}

#[tokio::test]
async fn ticker_stream_updates_cache_and_seals_candles_on_bucket_rollover() {
    let h = build_harness();
    let t0 = Timeframe::M1.bucket_start(Utc::now());

    h.pipeline.handle_for_test(ticker_event("BTC/USDT", 100.0, t0)).await;
    h.pipeline
        .handle_for_test(ticker_event("BTC/USDT", 102.0, t0 + chrono::Duration::seconds(30)))
        .await;

    let ticker = h.query.get_ticker(&"BTC/USDT".to_string()).unwrap();
    assert_eq!(ticker.last, 102.0);

    // Cross into the next 1m bucket: the prior bucket's candle should seal
    // and persist.
    let next_bucket = t0 + chrono::Duration::minutes(1);
    h.pipeline.handle_for_test(ticker_event("BTC/USDT", 105.0, next_bucket)).await;

    let candles = h
        .query
        .get_historical(&"BTC/USDT".to_string(), Timeframe::M1, None, None, None)
        .await
        .unwrap();
    assert_eq!(candles.len(), 1);
    assert_eq!(candles[0].open, 100.0);
    assert_eq!(candles[0].high, 102.0);
    assert_eq!(candles[0].close, 102.0);
}

#[tokio::test]
async fn book_snapshot_then_contiguous_delta_is_queryable_via_query_layer() {
    let h = build_harness();
    h.pipeline
        .handle_for_test(Event::BookSnapshot(BookSnapshotEvent {
            symbol: "BTC/USDT".to_string(),
            bids: vec![OrderBookLevel { price: 100.0, size: 1.0 }],
            asks: vec![OrderBookLevel { price: 101.0, size: 1.0 }],
            sequence: 1,
            source_ts: Utc::now(),
        }))
        .await;
    h.pipeline
        .handle_for_test(Event::BookDelta(BookDeltaEvent {
            symbol: "BTC/USDT".to_string(),
            bids: vec![OrderBookLevel { price: 99.0, size: 3.0 }],
            asks: vec![],
            sequence: 2,
            source_ts: Utc::now(),
        }))
        .await;

    let book = h.query.get_order_book(&"BTC/USDT".to_string()).unwrap();
    assert_eq!(book.sequence, 2);
    assert_eq!(book.bids.len(), 2);
    assert!(!book.is_crossed());
}

#[tokio::test]
async fn sequence_gap_drops_book_until_fresh_snapshot_arrives() {
    let h = build_harness();
    h.pipeline
        .handle_for_test(Event::BookSnapshot(BookSnapshotEvent {
            symbol: "ETH/USDT".to_string(),
            bids: vec![],
            asks: vec![],
            sequence: 1,
            source_ts: Utc::now(),
        }))
        .await;
    h.pipeline
        .handle_for_test(Event::BookDelta(BookDeltaEvent {
            symbol: "ETH/USDT".to_string(),
            bids: vec![],
            asks: vec![],
            sequence: 9,
            source_ts: Utc::now(),
        }))
        .await;

    assert!(h.query.get_order_book(&"ETH/USDT".to_string()).is_err());

    h.pipeline
        .handle_for_test(Event::BookSnapshot(BookSnapshotEvent {
            symbol: "ETH/USDT".to_string(),
            bids: vec![OrderBookLevel { price: 10.0, size: 1.0 }],
            asks: vec![],
            sequence: 50,
            source_ts: Utc::now(),
        }))
        .await;
    assert!(h.query.get_order_book(&"ETH/USDT".to_string()).is_ok());
}

#[tokio::test]
async fn subscribe_then_unsubscribe_round_trips_through_registry() {
    let h = build_harness();
    h.query
        .subscribe(Channel::Ticker, "SOL/USDT".to_string(), None)
        .await
        .unwrap();
    assert_eq!(h.query.health().subscription_count, 1);

    h.query.unsubscribe(Channel::Ticker, "SOL/USDT".to_string()).await.unwrap();
    assert_eq!(h.query.health().subscription_count, 0);
}

#[tokio::test]
async fn backfill_against_unreachable_host_reports_failure_without_panicking() {
    let h = build_harness();
    let from = Utc::now() - chrono::Duration::hours(1);
    let to = Utc::now();
    let result = h
        .query
        .start_backfill("BTC/USDT".to_string(), Timeframe::M1, from, to)
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.candles_imported, 0);
}

#[tokio::test]
async fn event_bus_delivers_ticker_changes_to_subscribers() {
    let h = build_harness();
    let sub = {
        // Reach through the query layer's public bus-subscribe surface.
        h.query.bus_subscribe()
    };
    h.pipeline
        .handle_for_test(ticker_event("BTC/USDT", 42.0, Utc::now()))
        .await;

    let event = tokio::time::timeout(Duration::from_millis(200), sub.recv())
        .await
        .expect("should receive an event")
        .expect("bus should still be open");
    match event {
        BusEvent::TickerChanged(t) => assert_eq!(t.last, 42.0),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn repeated_historical_query_is_served_from_cache_without_hitting_store() {
    let h = build_harness();
    let t0 = Timeframe::M1.bucket_start(Utc::now());
    h.pipeline.handle_for_test(ticker_event("BTC/USDT", 100.0, t0)).await;
    let next_bucket = t0 + chrono::Duration::minutes(1);
    h.pipeline.handle_for_test(ticker_event("BTC/USDT", 105.0, next_bucket)).await;

    h.query
        .get_historical(&"BTC/USDT".to_string(), Timeframe::M1, None, None, None)
        .await
        .unwrap();
    let reads_after_first = h.query.store_read_count();
    assert!(reads_after_first >= 1);

    h.query
        .get_historical(&"BTC/USDT".to_string(), Timeframe::M1, None, None, None)
        .await
        .unwrap();
    assert_eq!(
        h.query.store_read_count(),
        reads_after_first,
        "second identical query should be served from the query cache, not the store"
    );
}

#[tokio::test]
async fn historical_query_rejects_limit_out_of_range() {
    let h = build_harness();
    let err = h
        .query
        .get_historical(&"BTC/USDT".to_string(), Timeframe::M1, None, None, Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, marketdata_core::error::QueryError::BadRequest(_)));
}

mod mock_rest {
    use axum::extract::{Query, State};
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[derive(Clone)]
    pub struct MockRest {
        pub request_times: Arc<Mutex<Vec<Instant>>>,
        page: Arc<AtomicUsize>,
    }

    /// Serves three pages of candle rows on `/candles`, then an empty page
    /// to terminate the backfill loop, recording a timestamp per request so
    /// the caller can assert on inter-request pacing.
    pub async fn spawn() -> (String, MockRest) {
        let state = MockRest {
            request_times: Arc::new(Mutex::new(Vec::new())),
            page: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new().route("/candles", get(handler)).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{addr}"), state)
    }

    async fn handler(
        State(state): State<MockRest>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<Vec<(i64, f64, f64, f64, f64, f64)>> {
        state.request_times.lock().unwrap().push(Instant::now());
        let since: i64 = params.get("since").and_then(|s| s.parse().ok()).unwrap_or(0);
        let page = state.page.fetch_add(1, Ordering::SeqCst);
        let rows = match page {
            0 => vec![
                (since * 1000, 100.0, 101.0, 99.0, 100.5, 10.0),
                ((since + 60) * 1000, 100.5, 102.0, 100.0, 101.0, 12.0),
            ],
            1 => vec![((since + 60) * 1000, 101.0, 103.0, 100.5, 102.0, 14.0)],
            _ => vec![],
        };
        Json(rows)
    }
}

#[tokio::test]
async fn successful_backfill_paces_page_requests_at_least_one_second_apart() {
    let (rest_url, mock) = mock_rest::spawn().await;
    let h = build_harness_with_backfill(rest_url, Duration::from_secs(2), 1);

    let from = Utc::now() - chrono::Duration::hours(1);
    let to = Utc::now();
    let result = h
        .query
        .start_backfill("BTC/USDT".to_string(), Timeframe::M1, from, to)
        .await
        .unwrap();

    assert!(result.success, "backfill should succeed: {}", result.message);
    assert_eq!(result.candles_imported, 3);

    let times = mock.request_times.lock().unwrap();
    assert_eq!(times.len(), 3, "expected one request per page plus the terminating empty page");
    for pair in times.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(900),
            "consecutive backfill page requests must be paced ~1s apart, got {gap:?}"
        );
    }
}
