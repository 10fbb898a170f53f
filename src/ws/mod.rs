pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Opaque identifier for one transport session.
pub type ConnectionId = Uuid;

/// State held per live connection. Created on upgrade with the
/// authenticated user attached; the joined room is set and cleared by the
/// gateway dispatch path; the whole record is destroyed on disconnect.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub user_id: String,
    pub project_id: Option<String>,
    pub tx: ConnectionSender,
}

/// Connection registry: every live WebSocket connection keyed by its
/// connection id. A user can hold multiple concurrent connections
/// (devices/tabs), each with its own joined room.
pub type ConnectionRegistry = Arc<DashMap<ConnectionId, ConnectionEntry>>;

/// Create a new empty connection registry.
pub fn new_connection_registry() -> ConnectionRegistry {
    Arc::new(DashMap::new())
}

/// Room the connection currently has joined, or None. A missing
/// connection (already torn down) also reads as None.
pub fn joined_project(registry: &ConnectionRegistry, conn_id: ConnectionId) -> Option<String> {
    registry
        .get(&conn_id)
        .and_then(|entry| entry.project_id.clone())
}

/// Point a connection at a room (or clear it with None). Returns the
/// previous room. Callers must settle the presence tracker for both rooms
/// before yielding — registry and presence may never disagree across an
/// await point.
pub fn set_project(
    registry: &ConnectionRegistry,
    conn_id: ConnectionId,
    project_id: Option<String>,
) -> Option<String> {
    registry
        .get_mut(&conn_id)
        .map(|mut entry| std::mem::replace(&mut entry.project_id, project_id))
        .unwrap_or(None)
}
