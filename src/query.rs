//! Query layer: the one facade the API surface talks to. Combines the
//! state cache, OHLCV store + query cache, subscription registry,
//! connection manager, and backfill engine behind a single set of
//! operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backfill::{BackfillEngine, BackfillResult, CancelToken};
use crate::bus::{BusEvent, EventBus, OverflowPolicy, Subscriber};
use crate::cache::{QueryCache, StateCache};
use crate::connection::{ConnState, ConnectionHandle};
use crate::error::QueryError;
use crate::model::{Candle, Channel, OrderBook, Subscription, Symbol, Ticker, Timeframe};
use crate::registry::SubscriptionRegistry;
use crate::store::OhlcvStore;

const DEFAULT_HISTORICAL_LIMIT: u32 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub connected: bool,
    pub connection_state: String,
    pub reconnect_attempts: u64,
    pub ticker_cache_size: usize,
    pub book_cache_size: usize,
    pub subscription_count: usize,
    pub store_errors: u64,
}

pub struct QueryLayer {
    cache: Arc<StateCache>,
    query_cache: Arc<QueryCache>,
    store: Arc<OhlcvStore>,
    registry: Arc<SubscriptionRegistry>,
    connection: ConnectionHandle,
    backfill: Arc<BackfillEngine>,
    bus: Arc<EventBus>,
}

impl QueryLayer {
    pub fn new(
        cache: Arc<StateCache>,
        query_cache: Arc<QueryCache>,
        store: Arc<OhlcvStore>,
        registry: Arc<SubscriptionRegistry>,
        connection: ConnectionHandle,
        backfill: Arc<BackfillEngine>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            cache,
            query_cache,
            store,
            registry,
            connection,
            backfill,
            bus,
        }
    }

    pub fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker, QueryError> {
        self.cache
            .get_ticker(symbol)
            .ok_or_else(|| QueryError::not_found(format!("no ticker cached for {symbol}")))
    }

    pub fn get_all_tickers(&self) -> Vec<Ticker> {
        self.cache.all_tickers()
    }

    pub fn get_order_book(&self, symbol: &Symbol) -> Result<OrderBook, QueryError> {
        self.cache
            .get_book(symbol)
            .ok_or_else(|| QueryError::not_found(format!("no order book cached for {symbol}")))
    }

    pub async fn get_historical(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>, QueryError> {
        let limit = limit.unwrap_or(DEFAULT_HISTORICAL_LIMIT);
        if !(1..=1000).contains(&limit) {
            return Err(QueryError::bad_request(format!(
                "limit must be between 1 and 1000, got {limit}"
            )));
        }
        let key = QueryCache::key(
            symbol,
            timeframe,
            from.map(|d| d.timestamp()),
            to.map(|d| d.timestamp()),
            limit,
        );

        if let Some(cached) = self.query_cache.get(&key) {
            return Ok(cached);
        }

        let candles = self
            .store
            .query(symbol, timeframe, from, to, limit)
            .await
            .map_err(QueryError::Internal)?;

        self.query_cache.put(key, candles.clone());
        Ok(candles)
    }

    pub async fn start_backfill(
        &self,
        symbol: Symbol,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BackfillResult, QueryError> {
        if from >= to {
            return Err(QueryError::bad_request("`from` must be earlier than `to`"));
        }
        self.backfill
            .run(symbol, timeframe, from, to, CancelToken::new())
            .await
    }

    pub async fn subscribe(
        &self,
        channel: Channel,
        symbol: Symbol,
        depth: Option<u32>,
    ) -> Result<(), QueryError> {
        self.registry.subscribe(channel, symbol.clone(), depth);
        self.connection.notify_subscribe(Subscription {
            channel,
            symbol: symbol.clone(),
            depth,
        });
        self.bus
            .publish(BusEvent::Subscribed(Subscription { channel, symbol, depth }))
            .await;
        Ok(())
    }

    pub async fn unsubscribe(&self, channel: Channel, symbol: Symbol) -> Result<(), QueryError> {
        self.registry.unsubscribe(channel, &symbol);
        self.connection.notify_unsubscribe(channel, symbol.clone());
        self.bus.publish(BusEvent::Unsubscribed(channel, symbol)).await;
        Ok(())
    }

    pub fn health(&self) -> HealthStatus {
        let (ticker_cache_size, book_cache_size) = self.cache.sizes();
        HealthStatus {
            connected: self.connection.state() == ConnState::Connected,
            connection_state: self.connection.state().to_string(),
            reconnect_attempts: self.connection.reconnect_attempts(),
            ticker_cache_size,
            book_cache_size,
            subscription_count: self.registry.len(),
            store_errors: self.store.error_count(),
        }
    }

    /// Subscribe a local reader (e.g. a WebSocket client) to the live event
    /// bus, using the service-wide default queue capacity/policy.
    pub fn bus_subscribe(&self) -> Subscriber {
        self.bus.subscribe()
    }

    pub fn bus_subscribe_with(&self, capacity: usize, policy: OverflowPolicy) -> Subscriber {
        self.bus.subscribe_with(capacity, policy)
    }

    pub fn bus_unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    pub fn store_read_count(&self) -> u64 {
        self.store.read_count()
    }

    pub fn store_write_count(&self) -> u64 {
        self.store.write_count()
    }
}
