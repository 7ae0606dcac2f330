//! Budgeted in-process persistent tier.
//!
//! Same contract as [`LmdbTier`](super::LmdbTier) without touching disk.
//! Useful where no writable directory exists, and as a shared tier between
//! cache contexts in tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use corpus_core::{CacheEntry, CacheKey, TierError};

use super::traits::{footprint, EntryInfo, PersistentTier, TierUsage};

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, CacheEntry>,
    usage: TierUsage,
}

/// Persistent tier held in a mutex-guarded map.
pub struct InMemoryTier {
    budget_bytes: u64,
    inner: Mutex<Inner>,
}

impl InMemoryTier {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner().entries.contains_key(key)
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PersistentTier for InMemoryTier {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, TierError> {
        Ok(self.inner().entries.get(key).cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), TierError> {
        let mut inner = self.inner();
        let replaced = inner
            .entries
            .get(&entry.key)
            .map(footprint)
            .unwrap_or(0);
        let needed = inner.usage.stored_bytes - replaced + footprint(entry);
        if needed > self.budget_bytes {
            return Err(TierError::QuotaExceeded {
                needed,
                budget: self.budget_bytes,
            });
        }

        if let Some(previous) = inner.entries.insert(entry.key.clone(), entry.clone()) {
            inner.usage.remove(&previous);
        }
        inner.usage.add(entry);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, TierError> {
        let mut inner = self.inner();
        match inner.entries.remove(key) {
            Some(previous) => {
                inner.usage.remove(&previous);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<u64, TierError> {
        let mut inner = self.inner();
        let count = inner.entries.len() as u64;
        inner.entries.clear();
        inner.usage = TierUsage::default();
        Ok(count)
    }

    async fn entries(&self) -> Result<Vec<EntryInfo>, TierError> {
        let mut listing: Vec<EntryInfo> = self
            .inner()
            .entries
            .values()
            .map(|entry| EntryInfo {
                key: entry.key.clone(),
                created_at: entry.created_at,
                size_bytes: footprint(entry),
            })
            .collect();
        listing.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        Ok(listing)
    }

    async fn usage(&self) -> Result<TierUsage, TierError> {
        Ok(self.inner().usage)
    }

    fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn entry(key: &str, payload: &str) -> CacheEntry {
        CacheEntry::new(CacheKey::from(key), payload, payload.to_string(), 1)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let tier = InMemoryTier::new(1024);
        let e = entry("k", "payload");
        tier.put(&e).await.expect("put");
        assert_eq!(tier.get(&e.key).await.expect("get"), Some(e.clone()));
        assert!(tier.delete(&e.key).await.expect("delete"));
        assert!(!tier.delete(&e.key).await.expect("delete again"));
        assert_eq!(tier.get(&e.key).await.expect("get"), None);
        assert_eq!(tier.usage().await.expect("usage"), TierUsage::default());
    }

    #[tokio::test]
    async fn test_quota_enforced_and_overwrite_counts_once() {
        // footprint = 1 (key) + 9 (payload) = 10
        let tier = InMemoryTier::new(20);
        tier.put(&entry("a", "123456789")).await.expect("a");
        tier.put(&entry("b", "123456789")).await.expect("b");
        // Overwriting "a" with the same size fits.
        tier.put(&entry("a", "987654321")).await.expect("overwrite a");

        let err = tier.put(&entry("c", "123456789")).await;
        assert_eq!(
            err,
            Err(TierError::QuotaExceeded {
                needed: 30,
                budget: 20
            })
        );
        assert_eq!(tier.usage().await.expect("usage").stored_bytes, 20);
    }

    #[tokio::test]
    async fn test_entries_listed_oldest_first() {
        let tier = InMemoryTier::new(1024);
        let now = Utc::now();
        for (key, age) in [("new", 0), ("old", 20), ("mid", 10)] {
            let mut e = entry(key, "x");
            e.created_at = now - Duration::seconds(age);
            tier.put(&e).await.expect("put");
        }
        let keys: Vec<String> = tier
            .entries()
            .await
            .expect("entries")
            .into_iter()
            .map(|info| info.key.to_string())
            .collect();
        assert_eq!(keys, vec!["old", "mid", "new"]);
    }

    #[tokio::test]
    async fn test_clear() {
        let tier = InMemoryTier::new(1024);
        tier.put(&entry("a", "1")).await.expect("put");
        tier.put(&entry("b", "2")).await.expect("put");
        assert_eq!(tier.clear().await.expect("clear"), 2);
        assert!(tier.is_empty());
    }
}
