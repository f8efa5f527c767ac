//! Chat request orchestration.
//!
//! One request moves through admission, session and history setup, then a
//! relay of backend chunks to the caller:
//!
//! ```text
//! received -> admitted | rejected -> history loaded -> streaming -> completed | failed
//! ```
//!
//! Errors before the first chunk are returned to the caller. After that the
//! event stream simply ends. Messages are written to the fast tier inline and
//! to the durable repository through the [`TaskPool`].

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use metrics::{counter, histogram};
use shared::models::{
    ChatChunk, ChatMessage, ChatRequest, ChatStreamEvent, HistoryEntry, MessageRole,
    QuotaExceeded, SessionStartedEvent, StreamDoneEvent, validate_session_id,
};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{Instant, timeout_at},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    admission::AdmissionController,
    backend::{BackendError, ChunkStream, GenerationBackend, GenerationCall},
    history_cache::HistoryCache,
    repository::{ChatRepository, RepositoryError},
    task_pool::TaskPool,
    tenants::TenantDirectory,
};

const RELAY_BUFFER: usize = 32;

/// Why a chat request was refused before streaming began.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("caller identity is required")]
    Unauthenticated,
    #[error("{0}")]
    Validation(String),
    #[error("daily message quota exceeded ({} of {})", .0.used, .0.limit)]
    QuotaExceeded(QuotaExceeded),
    #[error("session {0} belongs to another user")]
    SessionForbidden(String),
    #[error("generation backend unavailable: {0}")]
    BackendUnavailable(#[source] BackendError),
    #[error("repository error: {0}")]
    Repository(#[source] RepositoryError),
    #[error("request exceeded its deadline")]
    TimedOut,
}

impl From<RepositoryError> for ChatError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::SessionOwnership { session_id } => Self::SessionForbidden(session_id),
            other => Self::Repository(other),
        }
    }
}

/// Authenticated identity of the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub tenant_id: Option<String>,
}

/// Tenant scope after directory lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    pub tenant_id: Option<String>,
    pub daily_limit: i64,
    pub group_ids: Vec<String>,
}

/// Time budgets for one chat request.
#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    /// Budget for the whole request, relay included.
    pub request_timeout: Duration,
    /// Budget for each background durable write.
    pub persist_timeout: Duration,
}

/// A started chat: the session it belongs to plus the caller-facing events.
#[derive(Debug)]
pub struct ChatStream {
    pub session_id: String,
    pub created: bool,
    pub events: ReceiverStream<ChatStreamEvent>,
}

/// Two-speed message persistence: fast tier inline, durable store in the
/// background.
#[derive(Clone)]
struct MessageWriter {
    history: HistoryCache,
    repository: Arc<dyn ChatRepository>,
    pool: Arc<TaskPool>,
    persist_timeout: Duration,
}

impl MessageWriter {
    async fn persist(&self, message: ChatMessage) {
        if let Err(err) = self.history.append_message(&message.session_id, &message).await {
            warn!(
                session_id = %message.session_id,
                role = message.role.as_str(),
                error = %err,
                "fast tier append failed"
            );
        }

        let repository = self.repository.clone();
        self.pool.submit_with_timeout(
            "message.persist",
            self.persist_timeout,
            move |token| async move {
                let message_id = message.id;
                tokio::select! {
                    biased;
                    result = repository.create_message(&message) => {
                        result?;
                        debug!(%message_id, role = message.role.as_str(), "message persisted");
                        Ok(())
                    }
                    () = token.cancelled() => {
                        Err(anyhow::anyhow!("durable write of message {message_id} cancelled"))
                    }
                }
            },
        );
    }
}

/// Chat pipeline from admission to the relayed answer.
pub struct ChatBridge {
    admission: Arc<dyn AdmissionController>,
    history: HistoryCache,
    repository: Arc<dyn ChatRepository>,
    backend: Arc<dyn GenerationBackend>,
    tenants: Arc<dyn TenantDirectory>,
    writer: MessageWriter,
    settings: BridgeSettings,
}

impl std::fmt::Debug for ChatBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatBridge")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ChatBridge {
    /// Wires the pipeline from its collaborators.
    pub fn new(
        admission: Arc<dyn AdmissionController>,
        history: HistoryCache,
        repository: Arc<dyn ChatRepository>,
        backend: Arc<dyn GenerationBackend>,
        tenants: Arc<dyn TenantDirectory>,
        pool: Arc<TaskPool>,
        settings: BridgeSettings,
    ) -> Self {
        let writer = MessageWriter {
            history: history.clone(),
            repository: repository.clone(),
            pool,
            persist_timeout: settings.persist_timeout,
        };
        Self {
            admission,
            history,
            repository,
            backend,
            tenants,
            writer,
            settings,
        }
    }

    /// Runs the pipeline up to the first backend chunk and hands back the
    /// event stream. The relay continues on its own task.
    pub async fn start(
        &self,
        caller: Option<&Caller>,
        request: ChatRequest,
    ) -> Result<ChatStream, ChatError> {
        let caller = caller.ok_or(ChatError::Unauthenticated)?;
        if request.query.trim().is_empty() {
            return Err(ChatError::Validation("query must not be empty".to_string()));
        }
        let session_id = match request.session_id {
            Some(id) => {
                validate_session_id(&id).map_err(|err| ChatError::Validation(err.to_string()))?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let deadline = Instant::now() + self.settings.request_timeout;
        let result = timeout_at(deadline, async {
            let scope = self.resolve_scope(caller).await;
            self.open(caller, scope, session_id, request.query, deadline)
                .await
        })
        .await;

        match result {
            Ok(started) => started,
            Err(_) => {
                counter!("chatgate_streams_total", "outcome" => "timed_out").increment(1);
                warn!(user_id = %caller.user_id, "chat request timed out before streaming");
                Err(ChatError::TimedOut)
            }
        }
    }

    /// Tenant limit and groups for the caller. Lookup failures degrade to an
    /// unscoped request on the lowest tier.
    pub async fn resolve_scope(&self, caller: &Caller) -> TenantScope {
        let unscoped = TenantScope {
            tenant_id: None,
            daily_limit: self.tenants.default_limit(),
            group_ids: Vec::new(),
        };
        let Some(tenant_id) = caller.tenant_id.as_deref() else {
            return unscoped;
        };

        let daily_limit = match self.tenants.daily_limit(tenant_id).await {
            Ok(Some(limit)) => limit,
            Ok(None) => {
                warn!(tenant_id, "unknown tenant; proceeding unscoped");
                return unscoped;
            }
            Err(err) => {
                warn!(tenant_id, error = %err, "tenant lookup failed; proceeding unscoped");
                return unscoped;
            }
        };

        let group_ids = self
            .tenants
            .group_ids(&caller.user_id, tenant_id)
            .await
            .unwrap_or_else(|err| {
                warn!(tenant_id, user_id = %caller.user_id, error = %err, "group lookup failed; no group scoping");
                Vec::new()
            });

        TenantScope {
            tenant_id: Some(tenant_id.to_string()),
            daily_limit,
            group_ids,
        }
    }

    async fn open(
        &self,
        caller: &Caller,
        scope: TenantScope,
        session_id: String,
        query: String,
        deadline: Instant,
    ) -> Result<ChatStream, ChatError> {
        let decision = self
            .admission
            .check_daily_limit(&caller.user_id, scope.tenant_id.as_deref(), scope.daily_limit)
            .await;
        if !decision.allowed {
            counter!("chatgate_streams_total", "outcome" => "rejected").increment(1);
            info!(
                user_id = %caller.user_id,
                used = decision.used,
                limit = decision.limit,
                "daily quota exhausted"
            );
            return Err(ChatError::QuotaExceeded(QuotaExceeded {
                used: decision.used,
                limit: decision.limit,
                reset_at: self.admission.reset_at(),
            }));
        }

        let (_, created) = self
            .repository
            .get_or_create_session(&session_id, &caller.user_id, scope.tenant_id.as_deref())
            .await?;

        let history = self
            .history
            .get_history(&session_id)
            .await
            .unwrap_or_else(|err| {
                warn!(%session_id, error = %err, "history unavailable; continuing without context");
                Vec::new()
            });

        self.writer
            .persist(ChatMessage::new(&session_id, MessageRole::User, query.clone()))
            .await;

        if let Err(err) = self.admission.increment_daily_count(&caller.user_id).await {
            warn!(user_id = %caller.user_id, error = %err, "failed to record quota usage");
        }

        let call = GenerationCall {
            query,
            session_id: session_id.clone(),
            user_id: caller.user_id.clone(),
            tenant_id: scope.tenant_id,
            group_ids: scope.group_ids,
            history: history.iter().map(HistoryEntry::from).collect(),
        };

        let mut stream = self.backend.open_stream(call).await.map_err(|err| {
            counter!("chatgate_streams_total", "outcome" => "backend_unavailable").increment(1);
            warn!(%session_id, error = %err, "backend stream failed to open");
            ChatError::BackendUnavailable(err)
        })?;

        let first = match stream.next().await {
            Some(Ok(chunk)) => Some(chunk),
            Some(Err(err)) => {
                counter!("chatgate_streams_total", "outcome" => "backend_unavailable").increment(1);
                warn!(%session_id, error = %err, "backend failed before the first chunk");
                return Err(ChatError::BackendUnavailable(err));
            }
            None => None,
        };

        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        if tx
            .send(ChatStreamEvent::Session(SessionStartedEvent {
                session_id: session_id.clone(),
                created,
            }))
            .await
            .is_err()
        {
            debug!(%session_id, "caller dropped before stream start");
        }

        let relay = Relay {
            writer: self.writer.clone(),
            session_id: session_id.clone(),
            tx,
            deadline,
        };
        tokio::spawn(relay.run(first, stream));

        Ok(ChatStream {
            session_id,
            created,
            events: ReceiverStream::new(rx),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayOutcome {
    Completed,
    Failed,
    Disconnected,
    TimedOut,
}

impl RelayOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
            Self::TimedOut => "timed_out",
        }
    }
}

struct Relay {
    writer: MessageWriter,
    session_id: String,
    tx: mpsc::Sender<ChatStreamEvent>,
    deadline: Instant,
}

impl Relay {
    async fn run(self, first: Option<ChatChunk>, mut stream: ChunkStream) {
        let started = std::time::Instant::now();
        let mut answer = String::new();
        let mut next = first;

        let outcome = loop {
            let Some(chunk) = next.take() else {
                break RelayOutcome::Completed;
            };
            answer.push_str(&chunk.answer_fragment);
            counter!("chatgate_stream_chunks_total").increment(1);
            if self.tx.send(ChatStreamEvent::Chunk(chunk)).await.is_err() {
                break RelayOutcome::Disconnected;
            }

            next = match timeout_at(self.deadline, stream.next()).await {
                Ok(Some(Ok(chunk))) => Some(chunk),
                Ok(None) => None,
                Ok(Some(Err(err))) => {
                    warn!(session_id = %self.session_id, error = %err, "backend stream failed mid-answer");
                    break RelayOutcome::Failed;
                }
                Err(_) => break RelayOutcome::TimedOut,
            };
        };

        if outcome == RelayOutcome::Completed {
            if !answer.is_empty() {
                self.writer
                    .persist(ChatMessage::new(&self.session_id, MessageRole::Assistant, answer))
                    .await;
            }
            if self
                .tx
                .send(ChatStreamEvent::Done(StreamDoneEvent {
                    session_id: self.session_id.clone(),
                }))
                .await
                .is_err()
            {
                debug!(session_id = %self.session_id, "caller dropped before done");
            }
        } else {
            warn!(
                session_id = %self.session_id,
                outcome = outcome.as_str(),
                "stream ended early; assistant reply not stored"
            );
        }

        counter!("chatgate_streams_total", "outcome" => outcome.as_str()).increment(1);
        #[allow(clippy::cast_precision_loss)]
        histogram!("chatgate_stream_duration_ms").record(started.elapsed().as_millis() as f64);
        debug!(session_id = %self.session_id, outcome = outcome.as_str(), "relay finished");
    }
}
