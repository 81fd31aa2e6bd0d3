use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::api::middleware::verify_client::client_key_matches;
use crate::api::server::AppState;
use crate::fanout::{LeaderboardEvent, Subscriber};

/// How long a fresh connection gets to authenticate before we hang up.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// Messages clients send us. Anything that fails to parse is ignored rather
/// than treated as a protocol error.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Auth {
        key: String,
    },
    Pong {
        #[serde(default)]
        #[allow(dead_code)]
        seq: Option<u64>,
    },
}

#[instrument(skip(ws, state))]
pub async fn scoreboard_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Browser websocket clients cannot set an `AUTHORIZATION` header, so the
/// first frame carries the client key instead.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let key = match tokio::time::timeout(AUTH_DEADLINE, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(&text) {
            Ok(ClientMessage::Auth { key }) => key,
            _ => {
                reject(&mut sender, "expected an auth message").await;
                return;
            }
        },
        Ok(_) => {
            reject(&mut sender, "expected an auth message").await;
            return;
        }
        Err(_) => {
            reject(&mut sender, "authentication deadline passed").await;
            return;
        }
    };

    match client_key_matches(&key).await {
        Ok(true) => {}
        Ok(false) => {
            reject(&mut sender, "invalid client key").await;
            return;
        }
        Err(err) => {
            warn!(error = ?err, "client key lookup failed");
            reject(&mut sender, "authentication unavailable").await;
            return;
        }
    }

    let subscriber = state.fanout.register().await;
    debug!(subscriber = %subscriber.id, "websocket subscriber authenticated");

    // current board first, deltas after
    let snapshot = state.dispatcher.snapshot_event().await;
    if send_event(&mut sender, &subscriber, &snapshot).await.is_err() {
        state.fanout.unregister(&subscriber.id).await;
        return;
    }

    let mut ping_interval = tokio::time::interval(state.fanout.config().heartbeat_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval fires immediately; the snapshot just went out, so swallow it
    ping_interval.tick().await;
    let mut ping_seq = 0u64;

    loop {
        tokio::select! {
            event = subscriber.queue.recv() => {
                if send_event(&mut sender, &subscriber, &event).await.is_err() {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                ping_seq += 1;
                let ping = LeaderboardEvent::Ping { seq: ping_seq };
                if send_event(&mut sender, &subscriber, &ping).await.is_err() {
                    break;
                }
            }
            _ = subscriber.evicted() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(ClientMessage::Pong { .. }) = serde_json::from_str(&text) {
                        subscriber.record_pong();
                    }
                }
                // protocol-level pongs count the same as json ones
                Some(Ok(Message::Pong(_))) => subscriber.record_pong(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = ?err, "websocket read failed");
                    break;
                }
            }
        }
    }

    state.fanout.unregister(&subscriber.id).await;
    debug!(subscriber = %subscriber.id, "websocket subscriber disconnected");
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    subscriber: &Subscriber,
    event: &LeaderboardEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await?;
    subscriber.record_delivery();
    Ok(())
}

async fn reject(sender: &mut SplitSink<WebSocket, Message>, reason: &str) {
    let body = serde_json::json!({
        "type": "error",
        "code": "UNAUTHENTICATED",
        "message": reason,
    });
    let _ = sender.send(Message::Text(body.to_string().into())).await;
    let _ = sender.send(Message::Close(None)).await;
}
