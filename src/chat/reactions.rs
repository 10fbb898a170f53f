//! Emoji reactions on messages.
//!
//! Adds are idempotent through the store's UNIQUE(message_id, user_id,
//! emoji) constraint — the load-modify-store race two concurrent reactors
//! would otherwise hit is resolved at the store, not round-tripped through
//! the application. After every mutation the full grouped map is re-read
//! and broadcast so clients resynchronize instead of applying diffs.

use std::collections::BTreeMap;

use rusqlite::Connection;

use crate::chat::membership;
use crate::db::DbPool;
use crate::error::ChatError;

/// Maximum emoji length (chars) — covers multi-codepoint sequences.
const MAX_EMOJI_LENGTH: usize = 64;

/// emoji -> user ids who reacted with it. Keys with empty sets never
/// appear: grouping only yields rows that exist.
pub type ReactionMap = BTreeMap<String, Vec<String>>;

/// Read the grouped reaction map for one message. Blocking.
pub fn reaction_map(conn: &Connection, message_id: &str) -> Result<ReactionMap, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT emoji, user_id FROM reactions WHERE message_id = ?1 ORDER BY emoji, id",
    )?;
    let rows = stmt.query_map(rusqlite::params![message_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut map = ReactionMap::new();
    for row in rows {
        let (emoji, user_id) = row?;
        map.entry(emoji).or_default().push(user_id);
    }
    Ok(map)
}

fn validate_emoji(emoji: &str) -> Result<String, ChatError> {
    let emoji = emoji.trim().to_string();
    if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_LENGTH {
        return Err(ChatError::Validation("invalid emoji".into()));
    }
    Ok(emoji)
}

/// Verify the message exists and belongs to the given project. Blocking.
fn check_message(conn: &Connection, message_id: &str, project_id: &str) -> Result<(), ChatError> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM messages WHERE id = ?1 AND project_id = ?2",
            rusqlite::params![message_id, project_id],
            |row| row.get::<_, i64>(0).map(|c| c > 0),
        )
        .unwrap_or(false);
    if exists {
        Ok(())
    } else {
        Err(ChatError::NotFound)
    }
}

/// Add the caller's reaction. Idempotent: reacting twice with the same
/// emoji leaves a single row. Returns the updated map for broadcast.
pub async fn add(
    db: &DbPool,
    user_id: &str,
    project_id: &str,
    message_id: &str,
    emoji: &str,
) -> Result<ReactionMap, ChatError> {
    let emoji = validate_emoji(emoji)?;
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
        check_message(&conn, &mid, &pid)?;

        conn.execute(
            "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji) VALUES (?1, ?2, ?3)",
            rusqlite::params![mid, uid, emoji],
        )?;

        reaction_map(&conn, &mid).map_err(ChatError::from)
    })
    .await?
}

/// Remove the caller's own reaction. Removing a reaction that does not
/// exist is `NotFound`. The emoji key disappears from the map with its
/// last row — no dangling empty sets.
pub async fn remove(
    db: &DbPool,
    user_id: &str,
    project_id: &str,
    message_id: &str,
    emoji: &str,
) -> Result<ReactionMap, ChatError> {
    let emoji = validate_emoji(emoji)?;
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
        check_message(&conn, &mid, &pid)?;

        let rows = conn.execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
            rusqlite::params![mid, uid, emoji],
        )?;
        if rows == 0 {
            return Err(ChatError::NotFound);
        }

        reaction_map(&conn, &mid).map_err(ChatError::from)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emoji_validation() {
        assert!(validate_emoji("👍").is_ok());
        assert!(validate_emoji("  ").is_err());
        assert!(validate_emoji(&"x".repeat(65)).is_err());
    }
}
