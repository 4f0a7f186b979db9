//! Push surface: a WebSocket that streams `market:ticker` / `market:orderbook`
//! events to subscribers with server-side channel/symbol filtering, ack'ing
//! each client-issued subscribe/unsubscribe directly.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::bus::BusEvent;
use crate::model::{Channel, Symbol};

use super::AppState;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        channel: String,
        symbol: String,
        depth: Option<u32>,
    },
    Unsubscribe {
        channel: String,
        symbol: String,
    },
}

fn channel_str(channel: Channel) -> &'static str {
    match channel {
        Channel::Ticker => "ticker",
        Channel::Orderbook => "orderbook",
    }
}

fn parse_channel(raw: &str) -> Option<Channel> {
    match raw {
        "ticker" => Some(Channel::Ticker),
        "orderbook" => Some(Channel::Orderbook),
        _ => None,
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let subscriber = state.query.bus_subscribe();
    let mut filter: HashSet<(Channel, Symbol)> = HashSet::new();

    loop {
        tokio::select! {
            event = subscriber.recv() => {
                match event {
                    Some(ev) => {
                        if let Some(text) = render(&ev, &filter) {
                            if sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, &mut filter, &text, &mut sender).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "ws_read_error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.query.bus_unsubscribe(subscriber.id());
}

async fn handle_client_message(
    state: &AppState,
    filter: &mut HashSet<(Channel, Symbol)>,
    text: &str,
    sender: &mut SplitSink<WebSocket, Message>,
) {
    let Ok(msg) = serde_json::from_str::<ClientMessage>(text) else {
        return;
    };

    match msg {
        ClientMessage::Subscribe { channel, symbol, depth } => {
            let Some(channel) = parse_channel(&channel) else { return };
            if state.query.subscribe(channel, symbol.clone(), depth).await.is_ok() {
                filter.insert((channel, symbol.clone()));
                let ack = serde_json::json!({
                    "type": "subscribed",
                    "channel": channel_str(channel),
                    "symbol": symbol,
                })
                .to_string();
                let _ = sender.send(Message::Text(ack)).await;
            }
        }
        ClientMessage::Unsubscribe { channel, symbol } => {
            let Some(channel) = parse_channel(&channel) else { return };
            if state.query.unsubscribe(channel, symbol.clone()).await.is_ok() {
                filter.remove(&(channel, symbol.clone()));
                let ack = serde_json::json!({
                    "type": "unsubscribed",
                    "channel": channel_str(channel),
                    "symbol": symbol,
                })
                .to_string();
                let _ = sender.send(Message::Text(ack)).await;
            }
        }
    }
}

fn render(event: &BusEvent, filter: &HashSet<(Channel, Symbol)>) -> Option<String> {
    let (channel, symbol, payload) = match event {
        BusEvent::TickerChanged(t) => (
            Channel::Ticker,
            t.symbol.clone(),
            serde_json::json!({ "type": "market:ticker", "ticker": t }),
        ),
        BusEvent::BookReplaced(b) => (
            Channel::Orderbook,
            b.symbol.clone(),
            serde_json::json!({ "type": "market:orderbook", "snapshot": true, "book": b }),
        ),
        BusEvent::BookChanged(b) => (
            Channel::Orderbook,
            b.symbol.clone(),
            serde_json::json!({ "type": "market:orderbook", "snapshot": false, "book": b }),
        ),
        BusEvent::Subscribed(_) | BusEvent::Unsubscribed(_, _) | BusEvent::BackfillCompleted(_) => {
            return None;
        }
    };

    if filter.contains(&(channel, symbol)) {
        Some(payload.to_string())
    } else {
        None
    }
}
