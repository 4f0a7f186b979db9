//! Runtime configuration, loaded from the environment with production-sane defaults.

use std::time::Duration;

use crate::bus::OverflowPolicy;
use crate::model::{Channel, Subscription};

/// All tunables for the service, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP/WS API binds to, e.g. "0.0.0.0:8080".
    pub bind_addr: String,

    /// Upstream WebSocket URL the connection manager dials.
    pub upstream_ws_url: String,
    /// Upstream REST base URL the backfill engine pages through.
    pub upstream_rest_url: String,

    /// Path to the SQLite OHLCV store.
    pub db_path: String,

    /// Reconnect backoff base delay.
    pub reconnect_base_delay: Duration,
    /// Reconnect backoff cap.
    pub reconnect_cap_delay: Duration,
    /// Attempts before giving up on the endpoint entirely (0 = unbounded).
    pub reconnect_max_attempts: u32,

    /// Interval between upstream pings while connected.
    pub heartbeat_interval: Duration,
    /// Liveness window, expressed as a multiple of `heartbeat_interval`.
    pub heartbeat_miss_multiplier: u32,

    /// Default bounded-queue capacity for new event bus subscribers.
    pub bus_default_capacity: usize,
    /// Default overflow policy for new event bus subscribers.
    pub bus_default_policy: OverflowPolicy,

    /// Time-to-live for cached historical query results.
    pub query_cache_ttl: Duration,

    /// Backfill REST page fetch timeout.
    pub backfill_page_timeout: Duration,
    /// Backfill retry attempts per page before giving up.
    pub backfill_max_retries: u32,
    /// Backfill token-bucket capacity.
    pub backfill_rate_limit_capacity: u32,
    /// Backfill token-bucket refill interval (one token per interval).
    pub backfill_rate_limit_interval: Duration,

    /// Subscriptions established automatically at startup.
    pub default_subscriptions: Vec<Subscription>,
}

impl Config {
    /// Load configuration from the environment, reading a `.env` file first
    /// if present. Every field falls back to a documented default so the
    /// service is runnable with zero configuration.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Ok(v) = std::env::var("MD_BIND_ADDR") {
            config.bind_addr = v;
        }
        if let Ok(v) = std::env::var("MD_UPSTREAM_WS_URL") {
            config.upstream_ws_url = v;
        }
        if let Ok(v) = std::env::var("MD_UPSTREAM_REST_URL") {
            config.upstream_rest_url = v;
        }
        if let Ok(v) = std::env::var("MD_DB_PATH") {
            config.db_path = v;
        }
        if let Ok(v) = std::env::var("MD_RECONNECT_BASE_DELAY_MS") {
            if let Ok(ms) = v.parse() {
                config.reconnect_base_delay = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("MD_RECONNECT_CAP_DELAY_MS") {
            if let Ok(ms) = v.parse() {
                config.reconnect_cap_delay = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("MD_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect_max_attempts = v.parse().unwrap_or(config.reconnect_max_attempts);
        }
        if let Ok(v) = std::env::var("MD_HEARTBEAT_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                config.heartbeat_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("MD_HEARTBEAT_MISS_MULTIPLIER") {
            config.heartbeat_miss_multiplier =
                v.parse().unwrap_or(config.heartbeat_miss_multiplier);
        }
        if let Ok(v) = std::env::var("MD_BUS_DEFAULT_CAPACITY") {
            config.bus_default_capacity = v.parse().unwrap_or(config.bus_default_capacity);
        }
        if let Ok(v) = std::env::var("MD_QUERY_CACHE_TTL_SECS") {
            if let Ok(secs) = v.parse() {
                config.query_cache_ttl = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("MD_BACKFILL_PAGE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                config.backfill_page_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("MD_BACKFILL_MAX_RETRIES") {
            config.backfill_max_retries = v.parse().unwrap_or(config.backfill_max_retries);
        }
        if let Ok(v) = std::env::var("MD_BACKFILL_RATE_LIMIT_CAPACITY") {
            config.backfill_rate_limit_capacity =
                v.parse().unwrap_or(config.backfill_rate_limit_capacity);
        }

        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            upstream_ws_url: "wss://stream.example.com/ws".to_string(),
            upstream_rest_url: "https://api.example.com".to_string(),
            db_path: "marketdata.db".to_string(),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_cap_delay: Duration::from_secs(60),
            reconnect_max_attempts: 0,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_miss_multiplier: 2,
            bus_default_capacity: 256,
            bus_default_policy: OverflowPolicy::DropOldest,
            query_cache_ttl: Duration::from_secs(30),
            backfill_page_timeout: Duration::from_secs(30),
            backfill_max_retries: 5,
            backfill_rate_limit_capacity: 1,
            backfill_rate_limit_interval: Duration::from_secs(1),
            default_subscriptions: vec![
                Subscription {
                    channel: Channel::Ticker,
                    symbol: "BTC/USDT".to_string(),
                    depth: None,
                },
                Subscription {
                    channel: Channel::Orderbook,
                    symbol: "BTC/USDT".to_string(),
                    depth: Some(50),
                },
            ],
        }
    }
}
