//! Upstream WebSocket connection manager.
//!
//! Owns the single connection to the upstream feed and drives it through a
//! small, explicit state machine with exponential backoff + jitter,
//! heartbeat-based liveness detection, and full resubscription on every
//! reconnect. Decoded frames are forwarded to the ingest pipeline over a
//! channel; this module never touches cache, store, or bus state directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, trace, warn};

use crate::codec::{Codec, Event};
use crate::model::{Channel, Subscription, Symbol};
use crate::registry::SubscriptionRegistry;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const JITTER_FACTOR: f64 = 0.3;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionReason {
    Started,
    ConnectSuccess,
    ConnectTimeout,
    ConnectFailed,
    ServerClose,
    NetworkError,
    HeartbeatStale,
    MaxAttemptsExceeded,
    ShutdownRequested,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::ConnectSuccess => "connect_ok",
            Self::ConnectTimeout => "connect_timeout",
            Self::ConnectFailed => "connect_failed",
            Self::ServerClose => "server_close",
            Self::NetworkError => "network_error",
            Self::HeartbeatStale => "heartbeat_stale",
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
            Self::ShutdownRequested => "shutdown",
        };
        write!(f, "{s}")
    }
}

/// Commands the rest of the service can send to a running connection.
enum ControlCommand {
    Subscribe(Subscription),
    Unsubscribe(Channel, Symbol),
    Shutdown,
}

/// Exponential backoff with jitter, reset on every successful connect.
struct BackoffCalculator {
    base: Duration,
    cap: Duration,
    attempt: u32,
    rng_state: u64,
}

impl BackoffCalculator {
    fn new(base: Duration, cap: Duration) -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9e3779b97f4a7c15);
        Self {
            base,
            cap,
            attempt: 0,
            rng_state: seed | 1,
        }
    }

    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    fn next_backoff(&mut self) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let scaled = base_ms * 2f64.powi(self.attempt as i32);
        let capped = scaled.min(self.cap.as_millis() as f64);
        let jitter = (self.next_random() * 2.0 - 1.0) * capped * JITTER_FACTOR;
        let final_ms = (capped + jitter).max(base_ms);
        self.attempt += 1;
        Duration::from_millis(final_ms as u64)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Cheap-to-clone handle for interacting with a running [`ConnectionManager`].
#[derive(Clone)]
pub struct ConnectionHandle {
    state: Arc<RwLock<ConnState>>,
    reconnect_attempts: Arc<AtomicU64>,
    cmd_tx: mpsc::UnboundedSender<ControlCommand>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Notify the connection to send a subscribe frame immediately if
    /// currently connected. If not connected, the subscription will be
    /// picked up by the full resubscribe-on-connect replay instead.
    pub fn notify_subscribe(&self, sub: Subscription) {
        let _ = self.cmd_tx.send(ControlCommand::Subscribe(sub));
    }

    pub fn notify_unsubscribe(&self, channel: Channel, symbol: Symbol) {
        let _ = self.cmd_tx.send(ControlCommand::Unsubscribe(channel, symbol));
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(ControlCommand::Shutdown);
    }
}

/// Tunables the connection manager needs; a projection of [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub ws_url: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_cap_delay: Duration,
    pub reconnect_max_attempts: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_multiplier: u32,
}

enum LoopExit {
    Reconnect(TransitionReason),
    Shutdown,
}

/// Drives the single upstream connection. Construct with [`ConnectionManager::new`]
/// and spawn [`ConnectionManager::run`] as its own task; interact with the
/// running instance through the paired [`ConnectionHandle`].
pub struct ConnectionManager {
    config: ConnectionConfig,
    registry: Arc<SubscriptionRegistry>,
    codec: Arc<Codec>,
    event_tx: mpsc::Sender<Event>,
    state: Arc<RwLock<ConnState>>,
    reconnect_attempts: Arc<AtomicU64>,
    cmd_rx: mpsc::UnboundedReceiver<ControlCommand>,
    backoff: BackoffCalculator,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        registry: Arc<SubscriptionRegistry>,
        codec: Arc<Codec>,
        event_tx: mpsc::Sender<Event>,
    ) -> (Self, ConnectionHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnState::Disconnected));
        let reconnect_attempts = Arc::new(AtomicU64::new(0));
        let backoff = BackoffCalculator::new(config.reconnect_base_delay, config.reconnect_cap_delay);

        let handle = ConnectionHandle {
            state: state.clone(),
            reconnect_attempts: reconnect_attempts.clone(),
            cmd_tx,
        };

        let manager = Self {
            config,
            registry,
            codec,
            event_tx,
            state,
            reconnect_attempts,
            cmd_rx,
            backoff,
        };

        (manager, handle)
    }

    fn set_state(&self, state: ConnState, reason: TransitionReason) {
        let prev = {
            let mut guard = self.state.write();
            let prev = *guard;
            *guard = state;
            prev
        };
        debug!(from = %prev, to = %state, reason = %reason, "connection_transition");
    }

    /// Run the connection until a `Shutdown` command is received. Never
    /// returns otherwise: connection loss always leads back to
    /// `Reconnecting` -> `Connecting`.
    pub async fn run(mut self) {
        loop {
            match self.run_connection().await {
                LoopExit::Shutdown => {
                    self.set_state(ConnState::Closed, TransitionReason::ShutdownRequested);
                    break;
                }
                LoopExit::Reconnect(reason) => {
                    self.set_state(ConnState::Reconnecting, reason);

                    let attempts = self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    if self.config.reconnect_max_attempts > 0
                        && attempts >= self.config.reconnect_max_attempts as u64
                    {
                        error!(attempts, "max_reconnect_attempts_exceeded");
                        self.set_state(ConnState::Closed, TransitionReason::MaxAttemptsExceeded);
                        break;
                    }

                    let delay = self.backoff.next_backoff();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        cmd = self.cmd_rx.recv() => {
                            if matches!(cmd, Some(ControlCommand::Shutdown) | None) {
                                self.set_state(ConnState::Closed, TransitionReason::ShutdownRequested);
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn run_connection(&mut self) -> LoopExit {
        self.set_state(ConnState::Connecting, TransitionReason::Started);

        let ws_stream = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(&self.config.ws_url),
        )
        .await
        {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "connect_failed");
                return LoopExit::Reconnect(TransitionReason::ConnectFailed);
            }
            Err(_) => {
                warn!("connect_timeout");
                return LoopExit::Reconnect(TransitionReason::ConnectTimeout);
            }
        };

        self.set_state(ConnState::Connected, TransitionReason::ConnectSuccess);
        self.backoff.reset();
        self.reconnect_attempts.store(0, Ordering::Relaxed);

        let (mut write, mut read) = ws_stream.split();

        let pending = self.registry.snapshot();
        if !pending.is_empty() {
            let frame = self.codec.encode_subscribe(&pending);
            if write.send(Message::Text(frame)).await.is_err() {
                return LoopExit::Reconnect(TransitionReason::NetworkError);
            }
        }

        let mut heartbeat_tick = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat_tick.tick().await; // first tick fires immediately; consume it
        let liveness_window = self.config.heartbeat_interval * self.config.heartbeat_miss_multiplier.max(1);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_seen = Instant::now();
                            match self.codec.decode(&text) {
                                Ok(event) => {
                                    if self.event_tx.send(event).await.is_err() {
                                        return LoopExit::Shutdown;
                                    }
                                }
                                Err(e) => trace!(error = %e, "decode_error"),
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_seen = Instant::now();
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_seen = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("upstream_closed");
                            return LoopExit::Reconnect(TransitionReason::ServerClose);
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "read_error");
                            return LoopExit::Reconnect(TransitionReason::NetworkError);
                        }
                        _ => {}
                    }
                }
                _ = heartbeat_tick.tick() => {
                    if last_seen.elapsed() > liveness_window {
                        warn!(elapsed_ms = last_seen.elapsed().as_millis() as u64, "heartbeat_stale");
                        return LoopExit::Reconnect(TransitionReason::HeartbeatStale);
                    }
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return LoopExit::Reconnect(TransitionReason::NetworkError);
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ControlCommand::Subscribe(sub)) => {
                            let frame = self.codec.encode_subscribe(std::slice::from_ref(&sub));
                            let _ = write.send(Message::Text(frame)).await;
                        }
                        Some(ControlCommand::Unsubscribe(channel, symbol)) => {
                            let sub = Subscription { channel, symbol, depth: None };
                            let frame = self.codec.encode_unsubscribe(std::slice::from_ref(&sub));
                            let _ = write.send(Message::Text(frame)).await;
                        }
                        Some(ControlCommand::Shutdown) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return LoopExit::Shutdown;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap_plus_jitter() {
        let mut backoff = BackoffCalculator::new(Duration::from_millis(100), Duration::from_secs(1));
        let cap_with_jitter = Duration::from_millis(1_000 + (1_000.0 * JITTER_FACTOR) as u64);
        for _ in 0..20 {
            let d = backoff.next_backoff();
            assert!(d <= cap_with_jitter, "{d:?} exceeded cap+jitter");
            assert!(d >= Duration::from_millis(100));
        }
    }

    #[test]
    fn backoff_resets_attempt_counter() {
        let mut backoff = BackoffCalculator::new(Duration::from_millis(100), Duration::from_secs(60));
        backoff.next_backoff();
        backoff.next_backoff();
        assert!(backoff.attempt >= 2);
        backoff.reset();
        assert_eq!(backoff.attempt, 0);
    }

    #[test]
    fn conn_state_display_uses_upper_snake_names() {
        assert_eq!(ConnState::Disconnected.to_string(), "DISCONNECTED");
        assert_eq!(ConnState::Reconnecting.to_string(), "RECONNECTING");
    }
}
