//! Mention notifier: persists notification records for mentioned users and
//! pushes a lightweight `new_notification` to each of their personal
//! channels — a mentioned user hears about it even without joining the
//! room. Best-effort per recipient: one failed insert is logged and
//! isolated, and never rolls back the message that carried the mention.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::chat::messages::SenderInfo;
use crate::db::DbPool;
use crate::error::ChatError;
use crate::state::AppState;
use crate::ws::broadcast::send_to_user;
use crate::ws::protocol::ServerEvent;
use crate::ws::ConnectionRegistry;

/// Notification kind written for project mentions.
pub const KIND_PROJECT_MENTION: &str = "PROJECT_MENTION";

/// Default page size for the notification listing.
const DEFAULT_LIMIT: u32 = 50;
/// Server-side cap on the notification listing.
const MAX_LIMIT: u32 = 100;

/// Persist and push a mention notification for each mentioned user.
/// Self-mentions are skipped. Returns the recipients whose notification
/// was persisted (and therefore pushed).
pub async fn notify_mentions(
    db: &DbPool,
    registry: &ConnectionRegistry,
    project_id: &str,
    sender: &SenderInfo,
    mentioned: &[String],
    body: &str,
) -> Vec<String> {
    let recipients: Vec<String> = mentioned
        .iter()
        .filter(|m| *m != &sender.id)
        .cloned()
        .collect();
    if recipients.is_empty() {
        return Vec::new();
    }

    let db = db.clone();
    let pid = project_id.to_string();
    let sender_id = sender.id.clone();
    // Owned copy for the insert closure; the original backs the unicasts
    let body_row = body.to_string();

    let persisted = tokio::task::spawn_blocking(move || {
        let conn = match db.lock() {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "DB lock poisoned, dropping mention notifications");
                return Vec::new();
            }
        };

        let mut persisted = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let id = Uuid::now_v7().to_string();
            let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
            let result = conn.execute(
                "INSERT INTO notifications (id, recipient_id, kind, project_id, body, sender_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![id, recipient, KIND_PROJECT_MENTION, pid, body_row, sender_id, created_at],
            );
            match result {
                Ok(_) => persisted.push(recipient),
                // Isolated per recipient — the rest still go out
                Err(e) => {
                    tracing::warn!(
                        recipient = %recipient,
                        error = %e,
                        "Failed to persist mention notification"
                    );
                }
            }
        }
        persisted
    })
    .await
    .unwrap_or_default();

    for recipient in &persisted {
        send_to_user(
            registry,
            recipient,
            &ServerEvent::NewNotification {
                notification_type: KIND_PROJECT_MENTION.to_string(),
                project_id: project_id.to_string(),
                message: body.to_string(),
                sender: sender.clone(),
            },
        );
    }

    persisted
}

// --- REST endpoint ---

#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub project_id: String,
    pub message: String,
    pub sender_id: String,
    pub created_at: String,
}

/// GET /api/notifications?limit={n} — The caller's persisted notifications,
/// newest first. JWT auth required.
pub async fn list_notifications(
    State(state): State<AppState>,
    claims: Claims,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<Vec<NotificationResponse>>, StatusCode> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let db = state.db.clone();
    let uid = claims.sub;

    let result = tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| ChatError::Store(format!("DB lock poisoned: {e}")))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, kind, project_id, body, sender_id, created_at
                 FROM notifications
                 WHERE recipient_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2",
            )
            .map_err(ChatError::from)?;

        let rows: Vec<NotificationResponse> = stmt
            .query_map(rusqlite::params![uid, limit as i64], |row| {
                Ok(NotificationResponse {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    project_id: row.get(2)?,
                    message: row.get(3)?,
                    sender_id: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .map_err(ChatError::from)?
            .collect::<Result<_, _>>()
            .map_err(ChatError::from)?;

        Ok::<_, ChatError>(rows)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .map_err(|e| e.status())?;

    Ok(Json(result))
}
