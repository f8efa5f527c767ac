use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use super::clock::{Clock, system_clock};

/// Failure of the counter store.
#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Key/value store holding integer counters that expire at a fixed instant.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value, or `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<i64>, CounterStoreError>;

    /// Atomically adds one and sets the expiry. Returns the new value.
    async fn increment_and_expire(
        &self,
        key: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<i64, CounterStoreError>;
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: i64,
    expires_at: DateTime<Utc>,
}

/// Process-local counter store.
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<String, CounterEntry>>,
    clock: Clock,
    unavailable: AtomicBool,
}

impl std::fmt::Debug for InMemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCounterStore")
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulates an outage: every call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CounterStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CounterStoreError::Unavailable(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, CounterStoreError> {
        self.check_available()?;
        let now = (self.clock)();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value)),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn increment_and_expire(
        &self,
        key: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<i64, CounterStoreError> {
        self.check_available()?;
        let now = (self.clock)();
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.to_string()).or_insert(CounterEntry {
            value: 0,
            expires_at: expire_at,
        });
        if entry.expires_at <= now {
            entry.value = 0;
        }
        entry.value += 1;
        entry.expires_at = expire_at;
        Ok(entry.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn missing_key_reads_as_none() {
        let store = InMemoryCounterStore::new();
        assert_eq!(store.get("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryCounterStore::new());
        let expire_at = Utc::now() + Duration::hours(1);

        let mut handles = Vec::new();
        for _ in 0..25 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment_and_expire("k", expire_at).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("k").await.unwrap(), Some(25));
    }

    #[tokio::test]
    async fn expired_counter_restarts_from_zero() {
        let store = InMemoryCounterStore::new();
        let past = Utc::now() - Duration::seconds(1);
        store.increment_and_expire("k", past).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);

        let future = Utc::now() + Duration::hours(1);
        assert_eq!(store.increment_and_expire("k", future).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = InMemoryCounterStore::new();
        store.set_unavailable(true);
        assert!(store.get("k").await.is_err());
        assert!(
            store
                .increment_and_expire("k", Utc::now() + Duration::hours(1))
                .await
                .is_err()
        );
    }
}
