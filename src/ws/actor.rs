//! Actor-per-connection: reader/writer split, liveness pings, and the
//! exactly-once disconnect teardown.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use uuid::Uuid;

use crate::state::AppState;
use crate::ws::{protocol, ConnectionEntry, ConnectionId};

/// Ping interval: server sends WebSocket ping every 30 seconds.
/// Prevents connection leaks from abrupt disconnects.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the actor for an authenticated WebSocket.
///
/// Splits the socket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader loop: decodes commands and dispatches through the gateway
///
/// The mpsc channel allows any part of the system to push events to this
/// client by cloning the sender. Commands on one connection are handled
/// sequentially by its reader loop, so an in-flight command always
/// finishes before the teardown at the bottom of this function — the
/// teardown therefore runs exactly once, even for abrupt disconnects.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let conn_id: ConnectionId = Uuid::now_v7();
    state.connections.insert(
        conn_id,
        ConnectionEntry {
            user_id: user_id.clone(),
            project_id: None,
            tx: tx.clone(),
        },
    );

    tracing::info!(
        user_id = %user_id,
        conn_id = %conn_id,
        connections = state.connections.len(),
        "WebSocket actor started"
    );

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            // Send ping
            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            // Wait for pong within timeout
            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    // Pong timeout or channel closed — close connection
                    tracing::warn!(conn_id = %conn_id, "Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Reader loop: process incoming WebSocket messages
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_frame(&text, conn_id, &tx, &state, &user_id).await;
                }
                Message::Binary(_) => {
                    // The protocol is JSON text frames; binary is ignored
                    tracing::debug!(
                        user_id = %user_id,
                        "Received binary frame (expected JSON text)"
                    );
                }
                Message::Pong(_) => {
                    // Pong received — notify the ping task
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    // Respond to client pings with pong
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = %user_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                // Stream ended — client disconnected
                tracing::info!(user_id = %user_id, "WebSocket stream ended");
                break;
            }
        }
    }

    // Cleanup: abort writer and ping tasks
    writer_handle.abort();
    ping_handle.abort();

    // Disconnect teardown, same sequence as leave_project: decrement
    // presence for the held room and emit user_offline to it if this was
    // the user's last connection there. Then destroy the registry record.
    protocol::leave_current_room(&state, conn_id, &user_id);
    state.connections.remove(&conn_id);

    tracing::info!(
        user_id = %user_id,
        conn_id = %conn_id,
        "WebSocket actor stopped"
    );
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}
