//! Request/response handlers for the query surface.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::model::{Channel, Timeframe};

use super::AppState;

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = match &self {
            QueryError::BadRequest(_) => StatusCode::BAD_REQUEST,
            QueryError::NotFound(_) => StatusCode::NOT_FOUND,
            QueryError::Upstream(_) => StatusCode::BAD_GATEWAY,
            QueryError::BackfillBusy { .. } => StatusCode::CONFLICT,
            QueryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub async fn health(State(state): State<AppState>) -> Json<crate::query::HealthStatus> {
    Json(state.query.health())
}

#[derive(Debug, Deserialize)]
pub struct SymbolQuery {
    pub symbol: String,
}

pub async fn get_ticker(
    State(state): State<AppState>,
    Query(params): Query<SymbolQuery>,
) -> Result<Json<crate::model::Ticker>, QueryError> {
    Ok(Json(state.query.get_ticker(&params.symbol)?))
}

pub async fn get_all_tickers(State(state): State<AppState>) -> Json<Vec<crate::model::Ticker>> {
    Json(state.query.get_all_tickers())
}

pub async fn get_order_book(
    State(state): State<AppState>,
    Query(params): Query<SymbolQuery>,
) -> Result<Json<crate::model::OrderBook>, QueryError> {
    Ok(Json(state.query.get_order_book(&params.symbol)?))
}

#[derive(Debug, Deserialize)]
pub struct HistoricalQuery {
    pub symbol: String,
    pub timeframe: String,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: Option<u32>,
}

fn parse_timeframe(raw: &str) -> Result<Timeframe, QueryError> {
    Timeframe::parse(raw).ok_or_else(|| QueryError::bad_request(format!("unknown timeframe: {raw}")))
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

pub async fn get_historical(
    State(state): State<AppState>,
    Query(params): Query<HistoricalQuery>,
) -> Result<Json<Vec<crate::model::Candle>>, QueryError> {
    let timeframe = parse_timeframe(&params.timeframe)?;
    let from = params.from.map(millis_to_datetime);
    let to = params.to.map(millis_to_datetime);
    let candles = state
        .query
        .get_historical(&params.symbol, timeframe, from, to, params.limit)
        .await?;
    Ok(Json(candles))
}

#[derive(Debug, Deserialize)]
pub struct BackfillRequest {
    pub symbol: String,
    pub timeframe: String,
    pub from: i64,
    pub to: i64,
}

pub async fn start_backfill(
    State(state): State<AppState>,
    Json(req): Json<BackfillRequest>,
) -> Result<Json<crate::backfill::BackfillResult>, QueryError> {
    let timeframe = parse_timeframe(&req.timeframe)?;
    let from = millis_to_datetime(req.from);
    let to = millis_to_datetime(req.to);
    let result = state.query.start_backfill(req.symbol, timeframe, from, to).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionRequest {
    pub channel: String,
    pub symbol: String,
    pub depth: Option<u32>,
}

fn parse_channel(raw: &str) -> Result<Channel, QueryError> {
    match raw {
        "ticker" => Ok(Channel::Ticker),
        "orderbook" => Ok(Channel::Orderbook),
        other => Err(QueryError::bad_request(format!("unknown channel: {other}"))),
    }
}

pub async fn subscribe(
    State(state): State<AppState>,
    Json(req): Json<SubscriptionRequest>,
) -> Result<StatusCode, QueryError> {
    let channel = parse_channel(&req.channel)?;
    state.query.subscribe(channel, req.symbol, req.depth).await?;
    Ok(StatusCode::OK)
}

pub async fn unsubscribe(
    State(state): State<AppState>,
    Json(req): Json<SubscriptionRequest>,
) -> Result<StatusCode, QueryError> {
    let channel = parse_channel(&req.channel)?;
    state.query.unsubscribe(channel, req.symbol).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub health: crate::query::HealthStatus,
    pub store_reads: u64,
    pub store_writes: u64,
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(CacheStats {
        health: state.query.health(),
        store_reads: state.query.store_read_count(),
        store_writes: state.query.store_write_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_error_maps_to_expected_status_codes() {
        assert_eq!(
            QueryError::bad_request("x").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            QueryError::not_found("x").into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            QueryError::BackfillBusy {
                symbol: "BTC/USDT".into(),
                timeframe: "1m".into()
            }
            .into_response()
            .status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn parse_timeframe_rejects_unknown_strings() {
        assert!(parse_timeframe("3m").is_err());
        assert!(parse_timeframe("1h").is_ok());
    }
}
