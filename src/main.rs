//! Service entry point: loads configuration, wires the connection manager,
//! ingest pipeline, state cache, OHLCV store, backfill engine and event
//! bus together, and serves the HTTP/WebSocket API until shutdown.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use marketdata_core::api::{self, AppState};
use marketdata_core::backfill::BackfillEngine;
use marketdata_core::bus::EventBus;
use marketdata_core::cache::{QueryCache, StateCache};
use marketdata_core::codec::Codec;
use marketdata_core::config::Config;
use marketdata_core::connection::{ConnectionConfig, ConnectionManager};
use marketdata_core::ingest::IngestPipeline;
use marketdata_core::query::QueryLayer;
use marketdata_core::registry::SubscriptionRegistry;
use marketdata_core::store::OhlcvStore;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env();
    info!(
        bind_addr = %config.bind_addr,
        upstream = %config.upstream_ws_url,
        "starting marketdata-core"
    );

    let cache = Arc::new(StateCache::new());
    let query_cache = Arc::new(QueryCache::new(config.query_cache_ttl));
    let store = Arc::new(OhlcvStore::open(&config.db_path)?);
    let bus = Arc::new(EventBus::new(
        config.bus_default_capacity,
        config.bus_default_policy,
    ));
    let registry = Arc::new(SubscriptionRegistry::new(config.default_subscriptions.clone()));
    let codec = Arc::new(Codec::new(std::iter::empty()));

    let (event_tx, event_rx) = mpsc::channel(1024);
    let (connection_manager, connection_handle) = ConnectionManager::new(
        ConnectionConfig {
            ws_url: config.upstream_ws_url.clone(),
            reconnect_base_delay: config.reconnect_base_delay,
            reconnect_cap_delay: config.reconnect_cap_delay,
            reconnect_max_attempts: config.reconnect_max_attempts,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_miss_multiplier: config.heartbeat_miss_multiplier,
        },
        registry.clone(),
        codec,
        event_tx,
    );

    let ingest = Arc::new(IngestPipeline::new(
        cache.clone(),
        store.clone(),
        bus.clone(),
        connection_handle.clone(),
    ));

    let backfill = Arc::new(BackfillEngine::new(
        config.upstream_rest_url.clone(),
        config.backfill_page_timeout,
        config.backfill_max_retries,
        config.backfill_rate_limit_capacity,
        config.backfill_rate_limit_interval,
        store.clone(),
        query_cache.clone(),
        bus.clone(),
    ));

    let query = Arc::new(QueryLayer::new(
        cache,
        query_cache,
        store,
        registry,
        connection_handle.clone(),
        backfill,
        bus,
    ));

    let connection_task = tokio::spawn(connection_manager.run());
    let ingest_task = tokio::spawn(ingest.clone().run(event_rx));

    let app = api::router(AppState { query });
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down: flushing open candles and closing upstream connection");
    ingest.flush().await;
    connection_handle.shutdown();
    ingest_task.abort();
    connection_task.abort();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
