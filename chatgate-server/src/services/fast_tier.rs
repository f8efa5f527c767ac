use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};

/// Failure of the fast tier.
#[derive(Debug, Error)]
pub enum FastTierError {
    #[error("fast tier unavailable: {0}")]
    Unavailable(String),
}

/// Low-latency list store with per-key expiry.
///
/// Indices follow list-range conventions: negative values count from the end,
/// `stop` is inclusive.
#[async_trait]
pub trait FastTier: Send + Sync {
    /// Appends `values` at the tail of the list.
    async fn push(&self, key: &str, values: &[String]) -> Result<(), FastTierError>;

    /// Inserts `values` at the head of the list, keeping their order.
    async fn push_front(&self, key: &str, values: &[String]) -> Result<(), FastTierError>;

    async fn range(&self, key: &str, start: isize, stop: isize)
    -> Result<Vec<String>, FastTierError>;

    async fn delete(&self, key: &str) -> Result<(), FastTierError>;

    /// Sets the time to live. Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, FastTierError>;
}

#[derive(Debug)]
struct ListEntry {
    values: Vec<String>,
    expires_at: Option<Instant>,
}

impl ListEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// Process-local fast tier.
#[derive(Debug, Default)]
pub struct InMemoryFastTier {
    lists: Mutex<HashMap<String, ListEntry>>,
    unavailable: AtomicBool,
}

impl InMemoryFastTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), FastTierError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FastTierError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

fn resolve_index(index: isize, len: usize) -> isize {
    let len = isize::try_from(len).unwrap_or(isize::MAX);
    if index < 0 { len + index } else { index }
}

#[async_trait]
impl FastTier for InMemoryFastTier {
    async fn push(&self, key: &str, values: &[String]) -> Result<(), FastTierError> {
        self.check_available()?;
        let now = Instant::now();
        let mut lists = self.lists.lock().await;
        let entry = lists.entry(key.to_string()).or_insert_with(|| ListEntry {
            values: Vec::new(),
            expires_at: None,
        });
        if !entry.is_live(now) {
            entry.values.clear();
            entry.expires_at = None;
        }
        entry.values.extend_from_slice(values);
        Ok(())
    }

    async fn push_front(&self, key: &str, values: &[String]) -> Result<(), FastTierError> {
        self.check_available()?;
        let now = Instant::now();
        let mut lists = self.lists.lock().await;
        let entry = lists.entry(key.to_string()).or_insert_with(|| ListEntry {
            values: Vec::new(),
            expires_at: None,
        });
        if !entry.is_live(now) {
            entry.values.clear();
            entry.expires_at = None;
        }
        entry.values.splice(0..0, values.iter().cloned());
        Ok(())
    }

    async fn range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, FastTierError> {
        self.check_available()?;
        let now = Instant::now();
        let mut lists = self.lists.lock().await;
        let Some(entry) = lists.get(key) else {
            return Ok(Vec::new());
        };
        if !entry.is_live(now) {
            lists.remove(key);
            return Ok(Vec::new());
        }

        let len = entry.values.len();
        let start = resolve_index(start, len).max(0);
        let stop = resolve_index(stop, len).min(isize::try_from(len).unwrap_or(isize::MAX) - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        #[allow(clippy::cast_sign_loss)]
        let slice = &entry.values[start as usize..=stop as usize];
        Ok(slice.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), FastTierError> {
        self.check_available()?;
        self.lists.lock().await.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, FastTierError> {
        self.check_available()?;
        let now = Instant::now();
        let mut lists = self.lists.lock().await;
        match lists.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            Some(_) => {
                lists.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[tokio::test]
    async fn range_supports_negative_indices() {
        let tier = InMemoryFastTier::new();
        tier.push("k", &strings(&["a", "b", "c", "d"])).await.unwrap();

        assert_eq!(tier.range("k", -2, -1).await.unwrap(), strings(&["c", "d"]));
        assert_eq!(tier.range("k", 0, -1).await.unwrap(), strings(&["a", "b", "c", "d"]));
        assert_eq!(tier.range("k", -10, 1).await.unwrap(), strings(&["a", "b"]));
        assert!(tier.range("k", 3, 1).await.unwrap().is_empty());
        assert!(tier.range("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_front_keeps_existing_tail() {
        let tier = InMemoryFastTier::new();
        tier.push("k", &strings(&["c"])).await.unwrap();
        tier.push_front("k", &strings(&["a", "b"])).await.unwrap();

        assert_eq!(tier.range("k", 0, -1).await.unwrap(), strings(&["a", "b", "c"]));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lists_disappear() {
        let tier = InMemoryFastTier::new();
        tier.push("k", &strings(&["a"])).await.unwrap();
        assert!(tier.expire("k", Duration::from_secs(5)).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(tier.range("k", 0, -1).await.unwrap().is_empty());
        assert!(!tier.expire("k", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn expire_on_missing_key_reports_false() {
        let tier = InMemoryFastTier::new();
        assert!(!tier.expire("nope", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let tier = InMemoryFastTier::new();
        tier.set_unavailable(true);
        assert!(tier.push("k", &strings(&["a"])).await.is_err());
        assert!(tier.range("k", 0, -1).await.is_err());
    }
}
