//! In-process memory tier with LRU eviction.
//!
//! Holds uncompressed values for the lifetime of the cache context. The tier
//! is bounded in bytes; inserting past the budget evicts the least recently
//! accessed entries first.
//!
//! Every removal bumps an invalidation generation. A reader that fetched a
//! value elsewhere promotes it with [`MemoryTier::insert_if_unchanged`], which
//! refuses the insert when anything was invalidated in between.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use corpus_core::CacheKey;
use tracing::debug;

struct MemoryEntry {
    value: Arc<str>,
    size_bytes: u64,
    last_access: u64,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<CacheKey, MemoryEntry>,
    total_bytes: u64,
    tick: u64,
    evictions: u64,
    generation: u64,
}

impl MemoryState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
                true
            }
            None => false,
        }
    }

    fn evict_lru(&mut self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone());
        match oldest {
            Some(key) => {
                debug!(key = %key, "Evicting least recently used memory entry");
                self.evictions += 1;
                self.remove(&key)
            }
            None => false,
        }
    }
}

/// Byte-bounded LRU map of uncompressed values.
pub struct MemoryTier {
    budget_bytes: u64,
    state: Mutex<MemoryState>,
}

impl MemoryTier {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<str>> {
        let mut state = self.state();
        let tick = state.next_tick();
        let entry = state.entries.get_mut(key)?;
        entry.last_access = tick;
        Some(Arc::clone(&entry.value))
    }

    /// Insert a value, evicting LRU entries to stay within budget.
    ///
    /// Returns `false` when the value alone exceeds the budget and was not
    /// cached.
    pub fn insert(&self, key: CacheKey, value: Arc<str>) -> bool {
        let mut state = self.state();
        self.insert_locked(&mut state, key, value)
    }

    /// Insert only if no removal happened since `generation` was read.
    pub fn insert_if_unchanged(&self, key: CacheKey, value: Arc<str>, generation: u64) -> bool {
        let mut state = self.state();
        if state.generation != generation {
            debug!(key = %key, "Memory tier invalidated during read, value not promoted");
            return false;
        }
        self.insert_locked(&mut state, key, value)
    }

    /// Current invalidation generation.
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut state = self.state();
        state.generation += 1;
        state.remove(key)
    }

    /// Drop every entry; returns how many were held.
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        state.generation += 1;
        let count = state.entries.len();
        state.entries.clear();
        state.total_bytes = 0;
        count
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.state().total_bytes
    }

    pub fn evictions(&self) -> u64 {
        self.state().evictions
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    fn insert_locked(&self, state: &mut MemoryState, key: CacheKey, value: Arc<str>) -> bool {
        let size_bytes = (key.as_str().len() + value.len()) as u64;
        state.remove(&key);

        if size_bytes > self.budget_bytes {
            debug!(key = %key, size_bytes, budget = self.budget_bytes, "Value exceeds memory budget, not cached");
            return false;
        }
        while state.total_bytes + size_bytes > self.budget_bytes {
            if !state.evict_lru() {
                break;
            }
        }

        let tick = state.next_tick();
        state.total_bytes += size_bytes;
        state.entries.insert(
            key,
            MemoryEntry {
                value,
                size_bytes,
                last_access: tick,
            },
        );
        true
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("budget_bytes", &self.budget_bytes)
            .field("entries", &self.len())
            .field("total_bytes", &self.total_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::from(name)
    }

    #[test]
    fn test_insert_get_remove() {
        let tier = MemoryTier::new(1024);
        assert!(tier.insert(key("a"), Arc::from("alpha")));
        assert_eq!(tier.get(&key("a")).as_deref(), Some("alpha"));
        assert_eq!(tier.total_bytes(), 6);

        assert!(tier.remove(&key("a")));
        assert!(!tier.remove(&key("a")));
        assert!(tier.get(&key("a")).is_none());
        assert_eq!(tier.total_bytes(), 0);
    }

    #[test]
    fn test_overwrite_replaces_size() {
        let tier = MemoryTier::new(1024);
        tier.insert(key("a"), Arc::from("short"));
        tier.insert(key("a"), Arc::from("a longer value"));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.total_bytes(), 15);
    }

    #[test]
    fn test_lru_eviction_prefers_least_recently_used() {
        // Each entry is 1 (key) + 9 (value) = 10 bytes.
        let tier = MemoryTier::new(30);
        tier.insert(key("a"), Arc::from("aaaaaaaaa"));
        tier.insert(key("b"), Arc::from("bbbbbbbbb"));
        tier.insert(key("c"), Arc::from("ccccccccc"));

        // Touch "a" so "b" becomes least recently used.
        assert!(tier.get(&key("a")).is_some());
        tier.insert(key("d"), Arc::from("ddddddddd"));

        assert!(tier.contains(&key("a")));
        assert!(!tier.contains(&key("b")));
        assert!(tier.contains(&key("c")));
        assert!(tier.contains(&key("d")));
        assert_eq!(tier.evictions(), 1);
        assert!(tier.total_bytes() <= 30);
    }

    #[test]
    fn test_oversized_value_not_cached() {
        let tier = MemoryTier::new(8);
        tier.insert(key("a"), Arc::from("ok"));
        assert!(!tier.insert(key("big"), Arc::from("far too large for this tier")));
        assert!(!tier.contains(&key("big")));
        assert!(tier.contains(&key("a")));
    }

    #[test]
    fn test_promotion_refused_after_invalidation() {
        let tier = MemoryTier::new(1024);
        let before = tier.generation();
        tier.remove(&key("a"));
        assert!(!tier.insert_if_unchanged(key("a"), Arc::from("stale"), before));
        assert!(!tier.contains(&key("a")));

        let current = tier.generation();
        assert!(tier.insert_if_unchanged(key("a"), Arc::from("fresh"), current));
        assert_eq!(tier.get(&key("a")).as_deref(), Some("fresh"));

        // A plain insert does not move the generation.
        tier.insert(key("b"), Arc::from("b"));
        assert_eq!(tier.generation(), current);
        tier.clear();
        assert_ne!(tier.generation(), current);
    }

    #[test]
    fn test_clear() {
        let tier = MemoryTier::new(1024);
        tier.insert(key("a"), Arc::from("1"));
        tier.insert(key("b"), Arc::from("2"));
        assert_eq!(tier.clear(), 2);
        assert!(tier.is_empty());
        assert_eq!(tier.total_bytes(), 0);
    }
}
