//! Error taxonomy for the chat core.
//!
//! Every refusal a client can cause has a stable wire code; the REST
//! surface maps the same taxonomy onto HTTP status codes. Internal store
//! failures are collapsed into `Store` so SQL details never leak to
//! clients.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("not a member of project {0}")]
    NotAMember(String),

    #[error("not joined to project {0}")]
    NotInRoom(String),

    #[error("resource not found")]
    NotFound,

    #[error("operation not permitted")]
    Forbidden,

    #[error("{0}")]
    Validation(String),

    #[error("storage failure: {0}")]
    Store(String),
}

impl ChatError {
    /// Stable wire code carried on `error` events. These strings are part
    /// of the protocol and must never change between releases.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthenticated => "UNAUTHENTICATED",
            ChatError::NotAMember(_) => "NOT_A_MEMBER",
            ChatError::NotInRoom(_) => "NOT_IN_ROOM",
            ChatError::NotFound => "NOT_FOUND",
            ChatError::Forbidden => "FORBIDDEN",
            ChatError::Validation(_) => "VALIDATION_FAILED",
            ChatError::Store(_) => "STORE_FAILURE",
        }
    }

    /// HTTP status for the REST surface.
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::NotAMember(_) | ChatError::Forbidden => StatusCode::FORBIDDEN,
            ChatError::NotInRoom(_) => StatusCode::CONFLICT,
            ChatError::NotFound => StatusCode::NOT_FOUND,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => ChatError::NotFound,
            other => ChatError::Store(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(e: tokio::task::JoinError) -> Self {
        ChatError::Store(format!("blocking task failed: {e}"))
    }
}
