//! OHLCV store: durable candlestick history backed by SQLite.
//!
//! A single connection behind a `tokio::sync::Mutex`, WAL mode for
//! concurrent readers, and idempotent upserts via `ON CONFLICT ... DO
//! UPDATE`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tracing::warn;

use crate::model::{Candle, Symbol, Timeframe};

/// Every store operation gets this long before it's considered hung.
const STORE_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Durable candlestick history. One SQLite file per running service.
pub struct OhlcvStore {
    conn: Arc<Mutex<Connection>>,
    reads: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

impl OhlcvStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening OHLCV store at {db_path}"))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting synchronous=NORMAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS candles (
                symbol        TEXT NOT NULL,
                timeframe     TEXT NOT NULL,
                bucket_start  INTEGER NOT NULL,
                open          REAL NOT NULL,
                high          REAL NOT NULL,
                low           REAL NOT NULL,
                close         REAL NOT NULL,
                volume        REAL NOT NULL,
                trade_count   INTEGER NOT NULL,
                authoritative INTEGER NOT NULL DEFAULT 0,
                updated_at    INTEGER NOT NULL,
                PRIMARY KEY (symbol, timeframe, bucket_start)
            );
            CREATE INDEX IF NOT EXISTS idx_candles_range
                ON candles (symbol, timeframe, bucket_start);",
        )
        .context("creating candles table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    /// Run `op` under a 10-second timeout, retrying exactly once if the
    /// first attempt times out. A second timeout (or a non-timeout error
    /// from either attempt) counts against the store-error counter and is
    /// propagated to the caller.
    async fn with_timeout_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(STORE_OP_TIMEOUT, op()).await {
            Ok(result) => result.map_err(|e| {
                self.errors.fetch_add(1, Ordering::Relaxed);
                e
            }),
            Err(_) => {
                warn!("store_operation_timed_out_retrying");
                match tokio::time::timeout(STORE_OP_TIMEOUT, op()).await {
                    Ok(result) => result.map_err(|e| {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        e
                    }),
                    Err(_) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        Err(anyhow!("store operation timed out after one retry"))
                    }
                }
            }
        }
    }

    /// Bulk idempotent upsert. `authoritative` marks the candles as coming
    /// from a verified backfill page, which always wins a conflict;
    /// non-authoritative (live-ingest) writes only overwrite a row that is
    /// no newer than the incoming write, so replaying the same sealed
    /// candle twice is a no-op.
    ///
    /// A store timeout (even after the retry) is logged and the candles are
    /// dropped rather than propagated, since a live-ingest seal must not
    /// block the rest of the pipeline.
    pub async fn upsert(&self, candles: &[Candle], authoritative: bool) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }
        match self.with_timeout_retry(|| self.upsert_inner(candles, authoritative)).await {
            Ok(applied) => Ok(applied),
            Err(e) => {
                warn!(error = %e, "candle_upsert_dropped_after_store_failure");
                Ok(0)
            }
        }
    }

    async fn upsert_inner(&self, candles: &[Candle], authoritative: bool) -> Result<usize> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "INSERT INTO candles
                (symbol, timeframe, bucket_start, open, high, low, close, volume, trade_count, authoritative, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(symbol, timeframe, bucket_start) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                trade_count = excluded.trade_count,
                authoritative = excluded.authoritative,
                updated_at = excluded.updated_at
             WHERE excluded.authoritative = 1 OR excluded.updated_at >= candles.updated_at",
        )?;

        let mut applied = 0;
        for candle in candles {
            let n = stmt.execute(params![
                candle.symbol,
                candle.timeframe.as_str(),
                candle.bucket_start.timestamp(),
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume,
                candle.trade_count as i64,
                authoritative as i64,
                now,
            ])?;
            applied += n;
        }
        Ok(applied)
    }

    /// Range query, ascending by bucket start. `limit` is clamped to
    /// `[1, 1000]`; callers needing the default apply it before calling.
    pub async fn query(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        self.with_timeout_retry(|| self.query_inner(symbol, timeframe, from, to, limit)).await
    }

    async fn query_inner(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;

        let mut rows = match (from, to) {
            (Some(f), Some(t)) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT symbol, timeframe, bucket_start, open, high, low, close, volume, trade_count
                     FROM candles WHERE symbol = ?1 AND timeframe = ?2
                     AND bucket_start >= ?3 AND bucket_start <= ?4
                     ORDER BY bucket_start ASC LIMIT ?5",
                )?;
                query_rows(
                    &mut stmt,
                    params![symbol, timeframe.as_str(), f.timestamp(), t.timestamp(), limit],
                )?
            }
            (Some(f), None) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT symbol, timeframe, bucket_start, open, high, low, close, volume, trade_count
                     FROM candles WHERE symbol = ?1 AND timeframe = ?2 AND bucket_start >= ?3
                     ORDER BY bucket_start ASC LIMIT ?4",
                )?;
                query_rows(&mut stmt, params![symbol, timeframe.as_str(), f.timestamp(), limit])?
            }
            (None, Some(t)) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT symbol, timeframe, bucket_start, open, high, low, close, volume, trade_count
                     FROM candles WHERE symbol = ?1 AND timeframe = ?2 AND bucket_start <= ?3
                     ORDER BY bucket_start DESC LIMIT ?4",
                )?;
                let mut rows = query_rows(&mut stmt, params![symbol, timeframe.as_str(), t.timestamp(), limit])?;
                rows.reverse();
                rows
            }
            (None, None) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT symbol, timeframe, bucket_start, open, high, low, close, volume, trade_count
                     FROM candles WHERE symbol = ?1 AND timeframe = ?2
                     ORDER BY bucket_start DESC LIMIT ?3",
                )?;
                let mut rows = query_rows(&mut stmt, params![symbol, timeframe.as_str(), limit])?;
                rows.reverse();
                rows
            }
        };

        rows.sort_by_key(|c| c.bucket_start);
        Ok(rows)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

fn query_rows(stmt: &mut rusqlite::CachedStatement<'_>, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Candle>> {
    let rows = stmt.query_map(params, |row| {
        let timeframe_str: String = row.get(1)?;
        let bucket_secs: i64 = row.get(2)?;
        Ok(Candle {
            symbol: row.get(0)?,
            timeframe: Timeframe::parse(&timeframe_str).unwrap_or(Timeframe::M1),
            bucket_start: Utc.timestamp_opt(bucket_secs, 0).single().unwrap_or_else(Utc::now),
            open: row.get(3)?,
            high: row.get(4)?,
            low: row.get(5)?,
            close: row.get(6)?,
            volume: row.get(7)?,
            trade_count: row.get::<_, i64>(8)? as u64,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().context("reading candle rows").map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn candle(symbol: &str, bucket_start: DateTime<Utc>, close: f64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            timeframe: Timeframe::M1,
            bucket_start,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            trade_count: 1,
        }
    }

    #[tokio::test]
    async fn upsert_then_query_round_trips() {
        let store = OhlcvStore::open(":memory:").unwrap();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        store.upsert(&[candle("BTC/USDT", t0, 100.0)], false).await.unwrap();

        let rows = store
            .query(&"BTC/USDT".to_string(), Timeframe::M1, None, None, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 100.0);
    }

    #[tokio::test]
    async fn repeated_upsert_of_same_candle_is_idempotent() {
        let store = OhlcvStore::open(":memory:").unwrap();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let c = candle("BTC/USDT", t0, 100.0);
        store.upsert(&[c.clone()], false).await.unwrap();
        store.upsert(&[c], false).await.unwrap();

        let rows = store
            .query(&"BTC/USDT".to_string(), Timeframe::M1, None, None, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 100.0);
    }

    #[tokio::test]
    async fn authoritative_backfill_overwrites_live_candle() {
        let store = OhlcvStore::open(":memory:").unwrap();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        store.upsert(&[candle("BTC/USDT", t0, 100.0)], false).await.unwrap();
        store.upsert(&[candle("BTC/USDT", t0, 105.0)], true).await.unwrap();

        let rows = store
            .query(&"BTC/USDT".to_string(), Timeframe::M1, None, None, 10)
            .await
            .unwrap();
        assert_eq!(rows[0].close, 105.0);
    }

    #[tokio::test]
    async fn range_query_respects_from_and_to() {
        let store = OhlcvStore::open(":memory:").unwrap();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        for i in 0..5 {
            let bucket = t0 + ChronoDuration::minutes(i);
            store.upsert(&[candle("BTC/USDT", bucket, 100.0 + i as f64)], false).await.unwrap();
        }

        let rows = store
            .query(
                &"BTC/USDT".to_string(),
                Timeframe::M1,
                Some(t0 + ChronoDuration::minutes(1)),
                Some(t0 + ChronoDuration::minutes(3)),
                10,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].close, 101.0);
        assert_eq!(rows[2].close, 103.0);
    }

    #[tokio::test]
    async fn limit_is_clamped_to_hard_cap() {
        let store = OhlcvStore::open(":memory:").unwrap();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        store.upsert(&[candle("BTC/USDT", t0, 1.0)], false).await.unwrap();
        let rows = store
            .query(&"BTC/USDT".to_string(), Timeframe::M1, None, None, 5000)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
