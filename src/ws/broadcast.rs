//! Fan-out primitives over the connection registry.
//!
//! `broadcast_to_project` is the sole write path to a room's clients;
//! `send_to_user` reaches all of one user's connections regardless of
//! room (mention notifications). Both are at-most-once: a send into a
//! closed channel is dropped silently and durable history is the
//! recovery path.

use axum::extract::ws::Message;

use super::protocol::ServerEvent;
use super::{ConnectionId, ConnectionRegistry, ConnectionSender};

fn encode(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode server event");
            None
        }
    }
}

/// Deliver an event to every connection currently joined to the room.
/// Membership of the fan-out set is decided by the registry's contents at
/// call time, never by state captured before an await.
pub fn broadcast_to_project(registry: &ConnectionRegistry, project_id: &str, event: &ServerEvent) {
    let Some(msg) = encode(event) else { return };

    for entry in registry.iter() {
        if entry.value().project_id.as_deref() == Some(project_id) {
            let _ = entry.value().tx.send(msg.clone());
        }
    }
}

/// Deliver an event to all of a user's connections, joined to a room or
/// not. Used for the personal notification channel.
pub fn send_to_user(registry: &ConnectionRegistry, user_id: &str, event: &ServerEvent) {
    let Some(msg) = encode(event) else { return };

    for entry in registry.iter() {
        if entry.value().user_id == user_id {
            let _ = entry.value().tx.send(msg.clone());
        }
    }
}

/// Deliver an event to a single connection, if it still exists. An
/// in-flight command whose connection disconnected mid-await lands here
/// as a no-op.
pub fn send_to_connection(registry: &ConnectionRegistry, conn_id: ConnectionId, event: &ServerEvent) {
    let Some(msg) = encode(event) else { return };

    if let Some(entry) = registry.get(&conn_id) {
        let _ = entry.value().tx.send(msg);
    }
}

/// Deliver an event straight down a connection's channel.
pub fn send_to_sender(tx: &ConnectionSender, event: &ServerEvent) {
    if let Some(msg) = encode(event) {
        let _ = tx.send(msg);
    }
}
