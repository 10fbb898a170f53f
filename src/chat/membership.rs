//! Membership guard: the authorization predicate for every room-scoped
//! command. Memberships are provisioned outside this server; we only read.

use rusqlite::Connection;

use crate::db::DbPool;
use crate::error::ChatError;

/// Role of a user within a project. Owner and admin may delete messages
/// they did not send; everything else is the same for all roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }

    /// Elevated roles may hard-delete other members' messages.
    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

/// Point lookup of a membership row. Returns None when the user is not a
/// member of the project. Blocking — call from within spawn_blocking.
pub fn find_role(
    conn: &Connection,
    project_id: &str,
    user_id: &str,
) -> Result<Option<MemberRole>, rusqlite::Error> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM project_members WHERE project_id = ?1 AND user_id = ?2",
            rusqlite::params![project_id, user_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    Ok(role.as_deref().and_then(MemberRole::from_str))
}

/// Require membership, returning the role or `NotAMember`.
/// Mandatory before join, send, list, react, edit, and delete.
pub async fn authorize(
    db: &DbPool,
    project_id: &str,
    user_id: &str,
) -> Result<MemberRole, ChatError> {
    let db = db.clone();
    let pid = project_id.to_string();
    let uid = user_id.to_string();

    let role = tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| ChatError::Store(format!("DB lock poisoned: {e}")))?;
        find_role(&conn, &pid, &uid).map_err(ChatError::from)
    })
    .await??;

    match role {
        Some(role) => Ok(role),
        None => Err(ChatError::NotAMember(project_id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing() {
        assert_eq!(MemberRole::from_str("owner"), Some(MemberRole::Owner));
        assert_eq!(MemberRole::from_str("admin"), Some(MemberRole::Admin));
        assert_eq!(MemberRole::from_str("member"), Some(MemberRole::Member));
        assert_eq!(MemberRole::from_str("superuser"), None);
    }

    #[test]
    fn elevation() {
        assert!(MemberRole::Owner.is_elevated());
        assert!(MemberRole::Admin.is_elevated());
        assert!(!MemberRole::Member.is_elevated());
    }
}
