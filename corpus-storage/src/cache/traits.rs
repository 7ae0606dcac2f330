//! Persistent tier trait and usage accounting.
//!
//! A persistent tier stores whole [`CacheEntry`] values keyed by
//! [`CacheKey`], enforces a byte budget, and can list its entries oldest
//! first so the store can evict under pressure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corpus_core::{CacheEntry, CacheKey, TierError};

/// Bytes an entry counts against a tier budget.
pub fn footprint(entry: &CacheEntry) -> u64 {
    (entry.key.as_str().len() + entry.payload.len()) as u64
}

/// Listing row used for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: CacheKey,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Aggregate usage of a tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierUsage {
    pub entries: u64,
    /// Bytes counted against the budget.
    pub stored_bytes: u64,
    pub compressed_bytes: u64,
    pub raw_bytes: u64,
}

impl TierUsage {
    /// Compressed over raw bytes; 0 when empty.
    pub fn compression_ratio(&self) -> f64 {
        if self.raw_bytes == 0 {
            0.0
        } else {
            self.compressed_bytes as f64 / self.raw_bytes as f64
        }
    }

    pub(crate) fn add(&mut self, entry: &CacheEntry) {
        self.entries += 1;
        self.stored_bytes += footprint(entry);
        self.compressed_bytes += entry.compressed_size_bytes;
        self.raw_bytes += entry.raw_size_bytes;
    }

    pub(crate) fn remove(&mut self, entry: &CacheEntry) {
        self.entries = self.entries.saturating_sub(1);
        self.stored_bytes = self.stored_bytes.saturating_sub(footprint(entry));
        self.compressed_bytes = self
            .compressed_bytes
            .saturating_sub(entry.compressed_size_bytes);
        self.raw_bytes = self.raw_bytes.saturating_sub(entry.raw_size_bytes);
    }
}

/// Durable tier of the cache.
///
/// Implementations are shared between cache contexts and must be safe for
/// concurrent use. Concurrent writers to the same key race last-write-wins.
#[async_trait]
pub trait PersistentTier: Send + Sync {
    /// Read an entry. An undecodable record is reported as
    /// [`TierError::Corrupt`].
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, TierError>;

    /// Write an entry, replacing any entry under the same key.
    ///
    /// Fails with [`TierError::QuotaExceeded`] when the write would push the
    /// tier over its budget.
    async fn put(&self, entry: &CacheEntry) -> Result<(), TierError>;

    /// Delete an entry; returns whether one existed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, TierError>;

    /// Remove every entry; returns how many were removed.
    async fn clear(&self) -> Result<u64, TierError>;

    /// All entries, oldest `created_at` first.
    async fn entries(&self) -> Result<Vec<EntryInfo>, TierError>;

    async fn usage(&self) -> Result<TierUsage, TierError>;

    /// Byte budget enforced by `put`.
    fn budget_bytes(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accounting() {
        let entry = CacheEntry::new(CacheKey::from("k"), "raw text", "ab".to_string(), 1);
        let mut usage = TierUsage::default();
        usage.add(&entry);
        assert_eq!(usage.entries, 1);
        assert_eq!(usage.stored_bytes, 3);
        assert_eq!(usage.raw_bytes, 8);
        assert!((usage.compression_ratio() - 0.25).abs() < f64::EPSILON);

        usage.remove(&entry);
        usage.remove(&entry);
        assert_eq!(usage, TierUsage::default());
        assert_eq!(usage.compression_ratio(), 0.0);
    }
}
