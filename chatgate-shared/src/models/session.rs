use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// Maximum accepted length for a caller-supplied session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Author of a single conversation turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Text sent by the end user.
    User,
    /// Text produced by the generation backend.
    Assistant,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl TryFrom<&str> for MessageRole {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err("invalid message role"),
        }
    }
}

/// One ongoing conversation. Identity fields never change after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One persisted turn of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Builds a new message stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(session_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Why a caller-supplied session id was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionIdError {
    #[error("session id must not be empty")]
    Empty,
    #[error("session id exceeds 128 characters")]
    TooLong,
    #[error("session id may only contain ASCII letters, digits, '-' and '_'")]
    InvalidCharacter,
}

/// Checks a caller-supplied session id before it reaches any store.
///
/// # Errors
/// Returns a [`SessionIdError`] describing the first violated rule.
pub fn validate_session_id(candidate: &str) -> Result<(), SessionIdError> {
    if candidate.is_empty() {
        return Err(SessionIdError::Empty);
    }
    if candidate.len() > MAX_SESSION_ID_LEN {
        return Err(SessionIdError::TooLong);
    }
    if !candidate
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(SessionIdError::InvalidCharacter);
    }
    Ok(())
}
