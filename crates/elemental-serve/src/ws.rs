// ABOUTME: WebSocket endpoint - channel subscriptions over the hub with heartbeat.
// ABOUTME: Missed pongs and lagged receivers both close the socket; the hub never stalls.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use elemental_core::Channel;

use crate::routes::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.hub.subscribe();
    let mut channels: HashSet<Channel> = HashSet::new();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    // The first tick fires immediately; skip it so the ping cadence starts
    // one interval in.
    ping.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = apply_client_message(&text, &mut channels) {
                            if socket.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive failed");
                        break;
                    }
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(event) if channels.contains(&event.channel) => {
                        let frame = json!({
                            "type": "event",
                            "channel": event.channel.as_str(),
                            "payload": event.payload,
                            "at": event.at,
                        });
                        if socket.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket client lagged, closing");
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = ping.tick() => {
                if awaiting_pong {
                    warn!("websocket client missed pong, closing");
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// Apply a subscribe/unsubscribe message; returns the acknowledgement frame.
fn apply_client_message(text: &str, channels: &mut HashSet<Channel>) -> Option<String> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "ignoring malformed websocket message");
            return None;
        }
    };
    match message {
        ClientMessage::Subscribe { channels: names } => {
            for name in names {
                if let Ok(channel) = name.parse::<Channel>() {
                    channels.insert(channel);
                }
            }
        }
        ClientMessage::Unsubscribe { channels: names } => {
            for name in names {
                if let Ok(channel) = name.parse::<Channel>() {
                    channels.remove(&channel);
                }
            }
        }
    }
    let mut subscribed: Vec<&str> = channels.iter().map(|c| c.as_str()).collect();
    subscribed.sort_unstable();
    Some(json!({ "type": "subscribed", "channels": subscribed }).to_string())
}
