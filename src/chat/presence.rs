//! Per-project presence tracking.
//!
//! Presence is per-user but reference-counted per connection: a user with
//! three tabs open in the same workroom is online once, and goes offline
//! only when the last of those connections leaves. Derived state — always
//! reconstructable from the connection registry, never authoritative.
//!
//! DashMap entry locking serializes mutation per project, so there is no
//! global lock across rooms. Total functions over in-memory maps; no I/O.

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use dashmap::DashMap;
use serde::Serialize;

use crate::auth::middleware::Claims;
use crate::chat::membership;
use crate::state::AppState;

#[derive(Debug, Default)]
pub struct PresenceTracker {
    /// project id -> (user id -> live connection count)
    rooms: DashMap<String, HashMap<String, usize>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a connection into a room. Returns true only on the 0 -> 1
    /// transition for that user, i.e. when a `user_online` event is due.
    pub fn mark_online(&self, project_id: &str, user_id: &str) -> bool {
        let mut room = self.rooms.entry(project_id.to_string()).or_default();
        let count = room.entry(user_id.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Count a connection out of a room. Returns true only when the user's
    /// last connection to that room closed, i.e. when `user_offline` is due.
    /// Unknown (project, user) pairs are a no-op.
    pub fn mark_offline(&self, project_id: &str, user_id: &str) -> bool {
        let mut went_offline = false;

        if let Some(mut room) = self.rooms.get_mut(project_id) {
            if let Some(count) = room.get_mut(user_id) {
                *count -= 1;
                if *count == 0 {
                    room.remove(user_id);
                    went_offline = true;
                }
            }
        }

        // The emptiness check must hold the entry lock: a join can land
        // between the guard drop above and this call, and an unconditional
        // remove would wipe that live user
        if went_offline {
            self.rooms.remove_if(project_id, |_, room| room.is_empty());
        }

        went_offline
    }

    /// Snapshot of who is online in a room, used for join acknowledgements.
    /// Order is not significant.
    pub fn list_online(&self, project_id: &str) -> Vec<String> {
        self.rooms
            .get(project_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a specific user is currently online in a room.
    pub fn is_online(&self, project_id: &str, user_id: &str) -> bool {
        self.rooms
            .get(project_id)
            .map(|room| room.contains_key(user_id))
            .unwrap_or(false)
    }
}

// --- REST endpoint ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineResponse {
    pub project_id: String,
    pub online: Vec<String>,
}

/// GET /api/projects/{id}/online — Live presence snapshot for a room.
/// JWT auth required; caller must be a member of the project.
pub async fn get_online(
    State(state): State<AppState>,
    claims: Claims,
    Path(project_id): Path<String>,
) -> Result<Json<OnlineResponse>, StatusCode> {
    membership::authorize(&state.db, &project_id, &claims.sub)
        .await
        .map_err(|e| e.status())?;

    let mut online = state.presence.list_online(&project_id);
    online.sort();

    Ok(Json(OnlineResponse { project_id, online }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_only_on_first_connection() {
        let tracker = PresenceTracker::new();
        assert!(tracker.mark_online("p1", "alice"));
        assert!(!tracker.mark_online("p1", "alice"));
        assert!(tracker.is_online("p1", "alice"));
    }

    #[test]
    fn offline_only_on_last_connection() {
        let tracker = PresenceTracker::new();
        tracker.mark_online("p1", "alice");
        tracker.mark_online("p1", "alice");
        assert!(!tracker.mark_offline("p1", "alice"));
        assert!(tracker.is_online("p1", "alice"));
        assert!(tracker.mark_offline("p1", "alice"));
        assert!(!tracker.is_online("p1", "alice"));
    }

    #[test]
    fn rooms_are_independent() {
        let tracker = PresenceTracker::new();
        tracker.mark_online("p1", "alice");
        tracker.mark_online("p2", "alice");
        assert!(tracker.mark_offline("p1", "alice"));
        assert!(tracker.is_online("p2", "alice"));
        assert!(!tracker.is_online("p1", "alice"));
    }

    #[test]
    fn unknown_user_offline_is_noop() {
        let tracker = PresenceTracker::new();
        assert!(!tracker.mark_offline("p1", "ghost"));
    }

    #[test]
    fn snapshot_reflects_any_interleaving() {
        let tracker = PresenceTracker::new();
        // Presence contains a user iff at least one connection holds the room
        tracker.mark_online("p1", "alice");
        tracker.mark_online("p1", "bob");
        tracker.mark_online("p1", "bob");
        tracker.mark_offline("p1", "bob");

        let mut online = tracker.list_online("p1");
        online.sort();
        assert_eq!(online, vec!["alice".to_string(), "bob".to_string()]);

        tracker.mark_offline("p1", "bob");
        assert_eq!(tracker.list_online("p1"), vec!["alice".to_string()]);
    }

    #[test]
    fn join_racing_room_teardown_survives() {
        use std::sync::{Arc, Barrier};

        // The last connection leaving a room must not wipe a user whose
        // join lands concurrently with the empty-room cleanup
        for _ in 0..2_000 {
            let tracker = Arc::new(PresenceTracker::new());
            tracker.mark_online("p1", "alice");
            let barrier = Arc::new(Barrier::new(2));

            let leaver = {
                let tracker = Arc::clone(&tracker);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    tracker.mark_offline("p1", "alice");
                })
            };
            let joiner = {
                let tracker = Arc::clone(&tracker);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    tracker.mark_online("p1", "bob");
                })
            };
            leaver.join().unwrap();
            joiner.join().unwrap();

            assert!(tracker.is_online("p1", "bob"));
            assert!(!tracker.is_online("p1", "alice"));
        }
    }
}
