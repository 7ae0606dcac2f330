//! Cross-context cache mutation events.
//!
//! The wire shape `{cacheKey, action, timestamp}` is shared with any other
//! code publishing on the same channel namespace, so it must not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::CacheKey;

/// What happened to a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Saved,
    Deleted,
    Cleared,
}

/// A cache mutation announced by the context that performed it.
///
/// Events are immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    cache_key: CacheKey,
    action: MutationAction,
    timestamp: DateTime<Utc>,
}

impl MutationEvent {
    pub fn new(cache_key: CacheKey, action: MutationAction) -> Self {
        Self {
            cache_key,
            action,
            timestamp: Utc::now(),
        }
    }

    pub fn saved(cache_key: CacheKey) -> Self {
        Self::new(cache_key, MutationAction::Saved)
    }

    pub fn deleted(cache_key: CacheKey) -> Self {
        Self::new(cache_key, MutationAction::Deleted)
    }

    /// A `cleared` event; it carries the wildcard key.
    pub fn cleared() -> Self {
        Self::new(CacheKey::wildcard(), MutationAction::Cleared)
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    pub fn action(&self) -> MutationAction {
        self.action
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
