//! In-memory state cache: the latest ticker and order book per symbol, plus
//! a short-lived cache of historical query results.
//!
//! Sharded by symbol hash (mirroring the upstream service's sharded ticker
//! cache) so that readers and writers for different symbols never contend
//! on the same lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::model::{Candle, OrderBook, OrderBookLevel, Symbol, Ticker, Timeframe};

const SHARD_COUNT: usize = 16;

fn shard_index(symbol: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

/// Outcome of applying a book delta against the cached book.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome {
    /// Applied cleanly; book updated in place.
    Applied(OrderBook),
    /// Sequence gap detected (`expected` vs `got`); cache left untouched.
    /// Caller must force a resnapshot.
    SequenceGap { expected: u64, got: u64 },
    /// No cached book to apply against; caller must force a resnapshot.
    NoSnapshot,
}

/// Sharded latest-state cache for tickers and order books.
pub struct StateCache {
    ticker_shards: Vec<RwLock<HashMap<Symbol, Ticker>>>,
    book_shards: Vec<RwLock<HashMap<Symbol, OrderBook>>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self {
            ticker_shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            book_shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    pub fn get_ticker(&self, symbol: &str) -> Option<Ticker> {
        self.ticker_shards[shard_index(symbol)].read().get(symbol).cloned()
    }

    pub fn all_tickers(&self) -> Vec<Ticker> {
        self.ticker_shards
            .iter()
            .flat_map(|shard| shard.read().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Replace the cached ticker, but only if `ticker.source_ts` is not
    /// older than what's already cached (protects against an out-of-order
    /// frame arriving after a reconnect-triggered resync).
    pub fn upsert_ticker(&self, ticker: Ticker) {
        let shard = &self.ticker_shards[shard_index(&ticker.symbol)];
        let mut map = shard.write();
        match map.get(&ticker.symbol) {
            Some(existing) if existing.source_ts > ticker.source_ts => {}
            _ => {
                map.insert(ticker.symbol.clone(), ticker);
            }
        }
    }

    pub fn get_book(&self, symbol: &str) -> Option<OrderBook> {
        self.book_shards[shard_index(symbol)].read().get(symbol).cloned()
    }

    pub fn replace_book(&self, book: OrderBook) {
        let shard = &self.book_shards[shard_index(&book.symbol)];
        shard.write().insert(book.symbol.clone(), book);
    }

    pub fn remove_book(&self, symbol: &str) {
        self.book_shards[shard_index(symbol)].write().remove(symbol);
    }

    /// Apply a delta batch to the cached book for `symbol`, enforcing
    /// strict sequence continuity (`sequence == cached.sequence + 1`).
    pub fn apply_book_delta(
        &self,
        symbol: &str,
        bid_updates: &[OrderBookLevel],
        ask_updates: &[OrderBookLevel],
        sequence: u64,
    ) -> DeltaOutcome {
        let shard = &self.book_shards[shard_index(symbol)];
        let mut map = shard.write();
        let Some(book) = map.get_mut(symbol) else {
            return DeltaOutcome::NoSnapshot;
        };

        let expected = book.sequence.wrapping_add(1);
        if sequence != expected {
            return DeltaOutcome::SequenceGap {
                expected,
                got: sequence,
            };
        }

        apply_levels(&mut book.bids, bid_updates, true);
        apply_levels(&mut book.asks, ask_updates, false);
        book.sequence = sequence;
        book.updated_at = chrono::Utc::now();
        DeltaOutcome::Applied(book.clone())
    }

    /// `(ticker_count, book_count)` for the health/cache-stats endpoint.
    pub fn sizes(&self) -> (usize, usize) {
        let tickers = self.ticker_shards.iter().map(|s| s.read().len()).sum();
        let books = self.book_shards.iter().map(|s| s.read().len()).sum();
        (tickers, books)
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Upsert/remove price levels in a sorted side of the book. `descending`
/// controls sort order (`true` for bids, `false` for asks). A `size` of
/// `0.0` removes the level.
fn apply_levels(side: &mut Vec<OrderBookLevel>, updates: &[OrderBookLevel], descending: bool) {
    for update in updates {
        let pos = side.iter().position(|l| l.price == update.price);
        if update.size == 0.0 {
            if let Some(idx) = pos {
                side.remove(idx);
            }
            continue;
        }
        match pos {
            Some(idx) => side[idx] = *update,
            None => side.push(*update),
        }
    }
    if descending {
        side.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
    } else {
        side.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
    }
}

/// Identifies one cached historical-query result.
type QueryKey = (Symbol, Timeframe, Option<i64>, Option<i64>, u32);

/// Short-TTL cache for [`crate::query::QueryLayer::get_historical`] results,
/// invalidated eagerly whenever a backfill job touches the matching
/// `(symbol, timeframe)` range.
pub struct QueryCache {
    ttl: Duration,
    entries: Mutex<HashMap<QueryKey, (Vec<Candle>, Instant)>>,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(
        symbol: &Symbol,
        timeframe: Timeframe,
        from: Option<i64>,
        to: Option<i64>,
        limit: u32,
    ) -> QueryKey {
        (symbol.clone(), timeframe, from, to, limit)
    }

    pub fn get(&self, key: &QueryKey) -> Option<Vec<Candle>> {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some((candles, at)) if at.elapsed() < self.ttl => Some(candles.clone()),
            _ => None,
        }
    }

    pub fn put(&self, key: QueryKey, candles: Vec<Candle>) {
        self.entries.lock().insert(key, (candles, Instant::now()));
    }

    /// Drop every cached entry for `(symbol, timeframe)`, regardless of the
    /// requested range, since a backfill may have filled gaps anywhere in
    /// it.
    pub fn invalidate(&self, symbol: &Symbol, timeframe: Timeframe) {
        self.entries
            .lock()
            .retain(|k, _| !(&k.0 == symbol && k.1 == timeframe));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn level(price: f64, size: f64) -> OrderBookLevel {
        OrderBookLevel { price, size }
    }

    fn book(symbol: &str, seq: u64) -> OrderBook {
        OrderBook {
            symbol: symbol.to_string(),
            bids: vec![level(100.0, 1.0)],
            asks: vec![level(101.0, 1.0)],
            updated_at: Utc::now(),
            sequence: seq,
        }
    }

    #[test]
    fn delta_with_correct_sequence_applies() {
        let cache = StateCache::new();
        cache.replace_book(book("BTC/USDT", 10));
        let outcome = cache.apply_book_delta("BTC/USDT", &[level(100.0, 2.0)], &[], 11);
        match outcome {
            DeltaOutcome::Applied(b) => {
                assert_eq!(b.sequence, 11);
                assert_eq!(b.bids[0].size, 2.0);
            }
            other => panic!("expected applied, got {other:?}"),
        }
    }

    #[test]
    fn delta_with_gap_is_rejected_and_cache_untouched() {
        let cache = StateCache::new();
        cache.replace_book(book("BTC/USDT", 10));
        let outcome = cache.apply_book_delta("BTC/USDT", &[], &[], 13);
        assert_eq!(
            outcome,
            DeltaOutcome::SequenceGap {
                expected: 11,
                got: 13
            }
        );
        assert_eq!(cache.get_book("BTC/USDT").unwrap().sequence, 10);
    }

    #[test]
    fn zero_size_update_removes_level() {
        let cache = StateCache::new();
        cache.replace_book(book("BTC/USDT", 1));
        let outcome = cache.apply_book_delta("BTC/USDT", &[level(100.0, 0.0)], &[], 2);
        match outcome {
            DeltaOutcome::Applied(b) => assert!(b.bids.is_empty()),
            other => panic!("expected applied, got {other:?}"),
        }
    }

    #[test]
    fn query_cache_respects_ttl() {
        let cache = QueryCache::new(Duration::from_millis(10));
        let key = QueryCache::key(&"BTC/USDT".to_string(), Timeframe::M1, None, None, 100);
        cache.put(key.clone(), vec![]);
        assert!(cache.get(&key).is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn query_cache_invalidate_clears_matching_symbol_timeframe() {
        let cache = QueryCache::new(Duration::from_secs(30));
        let key = QueryCache::key(&"BTC/USDT".to_string(), Timeframe::M1, None, None, 100);
        cache.put(key.clone(), vec![]);
        cache.invalidate(&"BTC/USDT".to_string(), Timeframe::M1);
        assert!(cache.get(&key).is_none());
    }
}
