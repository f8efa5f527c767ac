//! Durable chat storage.
//!
//! The repository is the source of truth for sessions and messages. The
//! request path only reads from it; message writes arrive through the task
//! pool.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{ChatMessage, MessageRole, Session};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Failure of the durable repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("session {session_id} belongs to another user")]
    SessionOwnership { session_id: String },
    #[error("stored message has unknown role '{0}'")]
    UnknownRole(String),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Durable store of sessions and messages.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    /// Returns the session and whether this call created it. Creating the same
    /// id twice yields one session.
    async fn get_or_create_session(
        &self,
        session_id: &str,
        user_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<(Session, bool), RepositoryError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, RepositoryError>;

    async fn create_message(&self, message: &ChatMessage) -> Result<(), RepositoryError>;

    /// Most recent `limit` messages, oldest first.
    async fn get_recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError>;

    /// Cheap round trip for readiness probes.
    async fn ping(&self) -> Result<(), RepositoryError>;
}

/// Postgres-backed repository over the `chatgate` schema.
#[derive(Debug, Clone)]
pub struct PgChatRepository {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    tenant_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            tenant_id: row.tenant_id,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    session_id: String,
    role: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for ChatMessage {
    type Error = RepositoryError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let role = MessageRole::try_from(row.role.as_str())
            .map_err(|_| RepositoryError::UnknownRole(row.role.clone()))?;
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            role,
            content: row.content,
            created_at: row.created_at,
        })
    }
}

impl PgChatRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatRepository for PgChatRepository {
    async fn get_or_create_session(
        &self,
        session_id: &str,
        user_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<(Session, bool), RepositoryError> {
        let inserted = sqlx::query_as::<_, SessionRow>(
            "INSERT INTO chatgate.sessions (id, user_id, tenant_id, created_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (id) DO NOTHING \
             RETURNING id, user_id, tenant_id, created_at",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing = sqlx::query_as::<_, SessionRow>(
            "SELECT id, user_id, tenant_id, created_at FROM chatgate.sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        if existing.user_id != user_id {
            return Err(RepositoryError::SessionOwnership {
                session_id: session_id.to_string(),
            });
        }
        Ok((existing.into(), false))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, user_id, tenant_id, created_at FROM chatgate.sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Session::from))
    }

    async fn create_message(&self, message: &ChatMessage) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO chatgate.messages (id, session_id, role, content, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, session_id, role, content, created_at FROM ( \
                 SELECT id, session_id, role, content, created_at \
                 FROM chatgate.messages WHERE session_id = $1 \
                 ORDER BY created_at DESC LIMIT $2 \
             ) recent ORDER BY created_at ASC",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChatMessage::try_from).collect()
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        crate::db::bootstrap::ensure_liveness(&self.pool).await?;
        Ok(())
    }
}

/// Process-local repository for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryChatRepository {
    sessions: RwLock<HashMap<String, Session>>,
    messages: RwLock<HashMap<String, Vec<ChatMessage>>>,
    fail_writes: AtomicBool,
}

impl InMemoryChatRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `create_message` call fail while set.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every stored message of a session, oldest first.
    pub async fn messages(&self, session_id: &str) -> Vec<ChatMessage> {
        let mut messages = self
            .messages
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        messages.sort_by_key(|message| message.created_at);
        messages
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Messages stored across all sessions.
    pub async fn message_count(&self) -> usize {
        self.messages.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl ChatRepository for InMemoryChatRepository {
    async fn get_or_create_session(
        &self,
        session_id: &str,
        user_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<(Session, bool), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session_id) {
            if existing.user_id != user_id {
                return Err(RepositoryError::SessionOwnership {
                    session_id: session_id.to_string(),
                });
            }
            return Ok((existing.clone(), false));
        }

        let session = Session {
            id: session_id.to_string(),
            user_id: user_id.to_string(),
            tenant_id: tenant_id.map(str::to_string),
            created_at: Utc::now(),
        };
        sessions.insert(session_id.to_string(), session.clone());
        Ok((session, true))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, RepositoryError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn create_message(&self, message: &ChatMessage) -> Result<(), RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("writes disabled".to_string()));
        }
        let mut messages = self.messages.write().await;
        let bucket = messages.entry(message.session_id.clone()).or_default();
        if !bucket.iter().any(|existing| existing.id == message.id) {
            bucket.push(message.clone());
        }
        Ok(())
    }

    async fn get_recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let messages = self.messages(session_id).await;
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}
