//! Two-tier conversation history.
//!
//! Reads hit the fast tier first and fall back to the durable repository on a
//! miss, scheduling a background refill. The fast tier is never authoritative:
//! it may be empty or evicted at any moment.

use std::{collections::HashSet, sync::Arc, time::Duration};

use metrics::counter;
use shared::models::ChatMessage;
use thiserror::Error;
use tracing::{debug, warn};

use super::{
    fast_tier::{FastTier, FastTierError},
    repository::{ChatRepository, RepositoryError},
    task_pool::TaskPool,
};

/// Failure of a history read or write.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    FastTier(#[from] FastTierError),
    #[error("failed to encode cached message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Window size, expiry and refill budget for [`HistoryCache`].
#[derive(Debug, Clone, Copy)]
pub struct HistorySettings {
    pub window: usize,
    pub ttl: Duration,
    pub repopulate_timeout: Duration,
}

/// Session history over a fast tier backed by the durable repository.
#[derive(Clone)]
pub struct HistoryCache {
    fast: Arc<dyn FastTier>,
    repository: Arc<dyn ChatRepository>,
    pool: Arc<TaskPool>,
    settings: HistorySettings,
}

impl std::fmt::Debug for HistoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryCache")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn history_key(session_id: &str) -> String {
    format!("history:{session_id}")
}

impl HistoryCache {
    /// Cache over `fast`, refilling from `repository` on `pool`.
    pub fn new(
        fast: Arc<dyn FastTier>,
        repository: Arc<dyn ChatRepository>,
        pool: Arc<TaskPool>,
        settings: HistorySettings,
    ) -> Self {
        Self {
            fast,
            repository,
            pool,
            settings,
        }
    }

    /// Number of messages returned by [`Self::get_history`].
    pub fn window(&self) -> usize {
        self.settings.window
    }

    /// Last `window` messages of the session, oldest first.
    pub async fn get_history(&self, session_id: &str) -> Result<Vec<ChatMessage>, HistoryError> {
        match self.read_fast(session_id).await {
            Ok(messages) if !messages.is_empty() => {
                counter!("chatgate_history_cache_total", "result" => "hit").increment(1);
                return Ok(messages);
            }
            Ok(_) => {
                counter!("chatgate_history_cache_total", "result" => "miss").increment(1);
            }
            Err(err) => {
                counter!("chatgate_history_cache_total", "result" => "error").increment(1);
                warn!(session_id, error = %err, "fast tier read failed; using durable store");
            }
        }

        let messages = self
            .repository
            .get_recent_messages(session_id, self.settings.window)
            .await?;

        if !messages.is_empty() {
            self.schedule_repopulate(session_id, messages.clone());
        }
        Ok(messages)
    }

    /// Replaces the cached list wholesale. Empty input leaves the cache alone.
    pub async fn set_history(
        &self,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> Result<(), HistoryError> {
        if messages.is_empty() {
            return Ok(());
        }
        let encoded = messages
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let key = history_key(session_id);
        self.fast.delete(&key).await?;
        self.fast.push(&key, &encoded).await?;
        self.fast.expire(&key, self.settings.ttl).await?;
        Ok(())
    }

    /// Puts a durable `snapshot` in front of whatever was cached since it was
    /// read. Messages already cached are skipped, so appends made in the
    /// meantime keep their place at the tail.
    pub async fn backfill_history(
        &self,
        session_id: &str,
        snapshot: &[ChatMessage],
    ) -> Result<(), HistoryError> {
        let key = history_key(session_id);
        let cached = self.fast.range(&key, 0, -1).await?;
        let decoded = cached
            .iter()
            .map(|raw| serde_json::from_str::<ChatMessage>(raw))
            .collect::<Result<Vec<_>, _>>();
        let Ok(decoded) = decoded else {
            return self.set_history(session_id, snapshot).await;
        };

        let cached_ids: HashSet<_> = decoded.iter().map(|message| message.id).collect();
        let missing = snapshot
            .iter()
            .filter(|message| !cached_ids.contains(&message.id))
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        if missing.is_empty() {
            return Ok(());
        }

        self.fast.push_front(&key, &missing).await?;
        self.fast.expire(&key, self.settings.ttl).await?;
        Ok(())
    }

    /// Appends one message and refreshes the expiry.
    pub async fn append_message(
        &self,
        session_id: &str,
        message: &ChatMessage,
    ) -> Result<(), HistoryError> {
        let encoded = serde_json::to_string(message)?;
        let key = history_key(session_id);
        self.fast.push(&key, &[encoded]).await?;
        self.fast.expire(&key, self.settings.ttl).await?;
        Ok(())
    }

    /// Evicts the cached entry. Durable messages are untouched.
    pub async fn delete_history(&self, session_id: &str) -> Result<(), HistoryError> {
        self.fast.delete(&history_key(session_id)).await?;
        Ok(())
    }

    async fn read_fast(&self, session_id: &str) -> Result<Vec<ChatMessage>, FastTierError> {
        let window = isize::try_from(self.settings.window).unwrap_or(isize::MAX);
        let raw = self
            .fast
            .range(&history_key(session_id), -window, -1)
            .await?;

        let mut messages = Vec::with_capacity(raw.len());
        let mut seen = HashSet::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<ChatMessage>(&entry) {
                Ok(message) => {
                    // Overlapping refills may leave a message cached twice.
                    if seen.insert(message.id) {
                        messages.push(message);
                    }
                }
                Err(err) => {
                    // A corrupt entry invalidates the whole cached window.
                    warn!(session_id, error = %err, "discarding undecodable cached history");
                    return Ok(Vec::new());
                }
            }
        }
        Ok(messages)
    }

    fn schedule_repopulate(&self, session_id: &str, messages: Vec<ChatMessage>) {
        let cache = self.clone();
        let session_id = session_id.to_string();
        self.pool.submit_with_timeout(
            "history.repopulate",
            self.settings.repopulate_timeout,
            move |token| async move {
                tokio::select! {
                    biased;
                    result = cache.backfill_history(&session_id, &messages) => {
                        result?;
                        debug!(session_id, count = messages.len(), "fast tier backfilled");
                        Ok(())
                    }
                    () = token.cancelled() => {
                        Err(anyhow::anyhow!("history repopulation for {session_id} cancelled"))
                    }
                }
            },
        );
    }
}
