//! Corpus Storage - Tiered Cache Engine
//!
//! Storage half of the corpus cache:
//!
//! - [`cache`]: memory tier, persistent tiers (LMDB and in-process) and the
//!   [`TieredCacheStore`] that composes them
//! - [`compression`]: the compressed payload format and the off-thread
//!   [`CompressionService`]
//! - [`sync`]: cross-context mutation broadcasting
//! - [`metrics`]: hit/miss counters and timing statistics

pub mod cache;
pub mod compression;
pub mod metrics;
pub mod sync;

pub use cache::{
    CacheHit, EntryInfo, InMemoryTier, LmdbTier, MemoryTier, PersistentTier, StoreConfig,
    TierUsage, TieredCacheStore, WriteOutcome,
};
pub use compression::{
    CompressionConfig, CompressionResult, CompressionService, ThreadSpawner, WorkerMode,
    WorkerSpawner,
};
pub use metrics::{MetricsRecorder, MetricsSnapshot, LOAD_TIME_WINDOW};
pub use sync::{EventHandler, Subscription, SyncBus, SyncHub, DEFAULT_CHANNEL_CAPACITY};
