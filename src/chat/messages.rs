//! Message service: persistence and shaping for chat messages.
//!
//! Live (`new_message`) and historical (`messages_loaded`) deliveries use
//! the same shaped representation so clients can merge the two streams
//! without reshaping. Broadcast is the caller's job and only ever follows
//! successful persistence.

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::reactions::{self, ReactionMap};
use crate::chat::{membership, SYSTEM_DISPLAY_NAME, SYSTEM_USER_ID};
use crate::db::DbPool;
use crate::error::ChatError;

/// Maximum message content length (chars).
const MAX_CONTENT_LENGTH: usize = 4000;
/// Default page size for message history.
const DEFAULT_TAKE: u32 = 50;
/// Server-side cap on a single history page, regardless of client request.
const MAX_TAKE: u32 = 200;
/// Reply summaries and notification bodies are truncated to this many chars.
const EXCERPT_LENGTH: usize = 140;

/// Denormalized sender info carried on every shaped message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    pub id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Summary of a replied-to message, enough for the client to render a
/// quote header without a second fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplySummary {
    pub id: String,
    pub sender_display_name: String,
    pub content: String,
}

/// Wire representation of a message, identical for live and historical
/// delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapedMessage {
    pub id: String,
    pub project_id: String,
    pub sender: SenderInfo,
    pub content: String,
    pub created_at: String,
    pub reply_to: Option<ReplySummary>,
    pub mentions: Vec<String>,
    pub edited: bool,
    pub edit_timestamp: Option<String>,
    pub reactions: ReactionMap,
}

/// Truncate content for reply summaries and notification bodies.
pub fn excerpt(content: &str) -> String {
    content.chars().take(EXCERPT_LENGTH).collect()
}

fn validate_content(content: &str) -> Result<String, ChatError> {
    let content = content.trim().to_string();
    if content.is_empty() {
        return Err(ChatError::Validation("message content is empty".into()));
    }
    if content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(ChatError::Validation(format!(
            "message content exceeds {MAX_CONTENT_LENGTH} chars"
        )));
    }
    Ok(content)
}

fn display_name_fallback(sender_id: &str) -> String {
    if sender_id == SYSTEM_USER_ID {
        SYSTEM_DISPLAY_NAME.to_string()
    } else {
        "Unknown".to_string()
    }
}

/// Load one message and shape it. Blocking — call under spawn_blocking.
fn load_shaped(conn: &Connection, message_id: &str) -> Result<ShapedMessage, ChatError> {
    let (
        id,
        project_id,
        sender_id,
        content,
        created_at,
        reply_to_id,
        mentions_json,
        edited,
        edit_timestamp,
        display_name,
        avatar_url,
    ): (
        String,
        String,
        String,
        String,
        String,
        Option<String>,
        String,
        bool,
        Option<String>,
        Option<String>,
        Option<String>,
    ) = conn.query_row(
        "SELECT m.id, m.project_id, m.sender_id, m.content, m.created_at,
                m.reply_to_id, m.mentions, m.edited, m.edit_timestamp,
                u.display_name, u.avatar_url
         FROM messages m
         LEFT JOIN users u ON u.id = m.sender_id
         WHERE m.id = ?1",
        rusqlite::params![message_id],
        |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get::<_, i64>(7)? != 0,
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
            ))
        },
    )?;

    // The store nulls reply_to_id when the target is deleted, so a present
    // id normally resolves; a race with a concurrent delete yields None.
    let reply_to = match &reply_to_id {
        Some(rid) => conn
            .query_row(
                "SELECT m.id, m.content, u.display_name, m.sender_id
                 FROM messages m
                 LEFT JOIN users u ON u.id = m.sender_id
                 WHERE m.id = ?1",
                rusqlite::params![rid],
                |row| {
                    let id: String = row.get(0)?;
                    let content: String = row.get(1)?;
                    let name: Option<String> = row.get(2)?;
                    let sender: String = row.get(3)?;
                    Ok((id, content, name, sender))
                },
            )
            .map(|(id, content, name, sender)| ReplySummary {
                id,
                content: excerpt(&content),
                sender_display_name: name.unwrap_or_else(|| display_name_fallback(&sender)),
            })
            .ok(),
        None => None,
    };

    let mentions: Vec<String> = serde_json::from_str(&mentions_json).unwrap_or_default();
    let reactions = reactions::reaction_map(conn, &id)?;
    let display_name = display_name.unwrap_or_else(|| display_name_fallback(&sender_id));

    Ok(ShapedMessage {
        id,
        project_id,
        sender: SenderInfo {
            id: sender_id,
            display_name,
            avatar_url,
        },
        content,
        created_at,
        reply_to,
        mentions,
        edited,
        edit_timestamp,
        reactions,
    })
}

/// Insert a message row and return it shaped. Blocking.
fn insert_message(
    conn: &Connection,
    project_id: &str,
    sender_id: &str,
    content: &str,
    reply_to_id: Option<&str>,
    mentions: &[String],
) -> Result<ShapedMessage, ChatError> {
    // Validate the reply target: must exist and live in the same room
    if let Some(rid) = reply_to_id {
        let reply_project: String = conn
            .query_row(
                "SELECT project_id FROM messages WHERE id = ?1",
                rusqlite::params![rid],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => ChatError::NotFound,
                other => ChatError::from(other),
            })?;
        if reply_project != project_id {
            return Err(ChatError::Validation(
                "reply target is in a different project".into(),
            ));
        }
    }

    let id = Uuid::now_v7().to_string();
    let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let mentions_json = serde_json::to_string(mentions)
        .map_err(|e| ChatError::Store(format!("mention encoding failed: {e}")))?;

    conn.execute(
        "INSERT INTO messages (id, project_id, sender_id, content, created_at, reply_to_id, mentions)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![id, project_id, sender_id, content, created_at, reply_to_id, mentions_json],
    )?;

    load_shaped(conn, &id)
}

/// Persist a new message from a member and return it shaped.
/// The caller broadcasts `new_message` and triggers the mention notifier
/// afterwards — never before persistence succeeds.
pub async fn send(
    db: &DbPool,
    user_id: &str,
    project_id: &str,
    content: &str,
    reply_to_id: Option<String>,
    mentions: Vec<String>,
) -> Result<ShapedMessage, ChatError> {
    let content = validate_content(content)?;

    // Dedup mentions, preserving first-seen order
    let mut seen = std::collections::HashSet::new();
    let mentions: Vec<String> = mentions
        .into_iter()
        .filter(|m| seen.insert(m.clone()))
        .collect();

    let db = db.clone();
    let uid = user_id.to_string();
    let pid = project_id.to_string();

    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| ChatError::Store(format!("DB lock poisoned: {e}")))?;

        membership::find_role(&conn, &pid, &uid)?
            .ok_or_else(|| ChatError::NotAMember(pid.clone()))?;

        insert_message(&conn, &pid, &uid, &content, reply_to_id.as_deref(), &mentions)
    })
    .await?
}

/// Persist a server-originated announcement. Bypasses the membership
/// guard by design; the caller broadcasts it as `system_message`.
pub async fn send_system_message(
    db: &DbPool,
    project_id: &str,
    content: &str,
) -> Result<ShapedMessage, ChatError> {
    let content = validate_content(content)?;
    let db = db.clone();
    let pid = project_id.to_string();

    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| ChatError::Store(format!("DB lock poisoned: {e}")))?;
        insert_message(&conn, &pid, SYSTEM_USER_ID, &content, None, &[])
    })
    .await?
}

/// Page through a room's history in ascending creation-time order (id as
/// tie-break), shaped identically to live messages. `take` is capped
/// server-side regardless of what the client asked for.
pub async fn list(
    db: &DbPool,
    user_id: &str,
    project_id: &str,
    take: Option<u32>,
    skip: Option<u32>,
) -> Result<Vec<ShapedMessage>, ChatError> {
    let take = take.unwrap_or(DEFAULT_TAKE).min(MAX_TAKE);
    let skip = skip.unwrap_or(0);

    let db = db.clone();
    let uid = user_id.to_string();
    let pid = project_id.to_string();

    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| ChatError::Store(format!("DB lock poisoned: {e}")))?;

        membership::find_role(&conn, &pid, &uid)?
            .ok_or_else(|| ChatError::NotAMember(pid.clone()))?;

        let mut stmt = conn.prepare(
            "SELECT id FROM messages
             WHERE project_id = ?1
             ORDER BY created_at ASC, id ASC
             LIMIT ?2 OFFSET ?3",
        )?;
        let ids: Vec<String> = stmt
            .query_map(rusqlite::params![pid, take as i64, skip as i64], |row| {
                row.get(0)
            })?
            .collect::<Result<_, _>>()?;

        ids.iter().map(|id| load_shaped(&conn, id)).collect()
    })
    .await?
}

/// Edit a message's body. Only the original sender may edit — an elevated
/// role does not help here.
pub async fn edit(
    db: &DbPool,
    user_id: &str,
    project_id: &str,
    message_id: &str,
    new_content: &str,
) -> Result<ShapedMessage, ChatError> {
    let content = validate_content(new_content)?;
    let db = db.clone();
    let uid = user_id.to_string();
    let pid = project_id.to_string();
    let mid = message_id.to_string();

    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| ChatError::Store(format!("DB lock poisoned: {e}")))?;

        membership::find_role(&conn, &pid, &uid)?
            .ok_or_else(|| ChatError::NotAMember(pid.clone()))?;

        let sender_id: String = conn
            .query_row(
                "SELECT sender_id FROM messages WHERE id = ?1 AND project_id = ?2",
                rusqlite::params![mid, pid],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => ChatError::NotFound,
                other => ChatError::from(other),
            })?;

        if sender_id != uid {
            return Err(ChatError::Forbidden);
        }

        let edit_timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        conn.execute(
            "UPDATE messages SET content = ?1, edited = 1, edit_timestamp = ?2 WHERE id = ?3",
            rusqlite::params![content, edit_timestamp, mid],
        )?;

        load_shaped(&conn, &mid)
    })
    .await?
}

/// Hard-delete a message. Allowed for the sender and for elevated roles.
/// Reactions cascade away and replies get their reply reference nulled at
/// the store. The caller broadcasts `message_deleted` with ids only.
pub async fn delete(
    db: &DbPool,
    user_id: &str,
    project_id: &str,
    message_id: &str,
) -> Result<(), ChatError> {
    let db = db.clone();
    let uid = user_id.to_string();
    let pid = project_id.to_string();
    let mid = message_id.to_string();

    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| ChatError::Store(format!("DB lock poisoned: {e}")))?;

        let role = membership::find_role(&conn, &pid, &uid)?
            .ok_or_else(|| ChatError::NotAMember(pid.clone()))?;

        let sender_id: String = conn
            .query_row(
                "SELECT sender_id FROM messages WHERE id = ?1 AND project_id = ?2",
                rusqlite::params![mid, pid],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => ChatError::NotFound,
                other => ChatError::from(other),
            })?;

        if sender_id != uid && !role.is_elevated() {
            return Err(ChatError::Forbidden);
        }

        conn.execute("DELETE FROM messages WHERE id = ?1", rusqlite::params![mid])?;
        Ok(())
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_truncates_on_char_boundary() {
        let long: String = "é".repeat(200);
        let cut = excerpt(&long);
        assert_eq!(cut.chars().count(), 140);
    }

    #[test]
    fn content_validation() {
        assert!(validate_content("   ").is_err());
        assert!(validate_content("hi").is_ok());
        let too_long = "x".repeat(4001);
        assert!(validate_content(&too_long).is_err());
        // Trim happens before the length check
        assert_eq!(validate_content("  hi  ").unwrap(), "hi");
    }
}
