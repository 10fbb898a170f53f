use std::sync::Arc;

use crate::chat::presence::PresenceTracker;
use crate::db::DbPool;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
///
/// The connection registry and presence tracker are process-wide and
/// mutated only from the gateway dispatch path; the store is the single
/// durable resource.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Active WebSocket connections keyed by connection id
    pub connections: ConnectionRegistry,
    /// Per-project presence refcounts, derived from the registry
    pub presence: Arc<PresenceTracker>,
}
