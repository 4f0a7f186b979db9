//! Typed errors for the query layer and API edge.

use thiserror::Error;

/// Errors surfaced by [`crate::query::QueryLayer`] operations.
///
/// Internal plumbing (connection, ingest, store) uses `anyhow` for
/// context-rich propagation; this enum is the narrow, typed boundary the
/// API layer maps to HTTP status codes.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error("backfill already in progress for {symbol} {timeframe}")]
    BackfillBusy { symbol: String, timeframe: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl QueryError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
