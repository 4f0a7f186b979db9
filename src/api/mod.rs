//! HTTP + WebSocket API surface: request/response queries plus a push
//! channel for live ticker/order-book updates.

pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::query::QueryLayer;

#[derive(Clone)]
pub struct AppState {
    pub query: Arc<QueryLayer>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/tickers", get(routes::get_all_tickers))
        .route("/ticker", get(routes::get_ticker))
        .route("/orderbook", get(routes::get_order_book))
        .route("/historical", get(routes::get_historical))
        .route("/backfill", post(routes::start_backfill))
        .route("/subscribe", post(routes::subscribe))
        .route("/unsubscribe", post(routes::unsubscribe))
        .route("/cache-stats", get(routes::cache_stats))
        .route("/ws", get(ws::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
