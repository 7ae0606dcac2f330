//! Tiered corpus cache.
//!
//! The [`MemoryTier`] holds uncompressed values for the lifetime of one cache
//! context. A [`PersistentTier`] holds compressed [`CacheEntry`] records that
//! outlive it and are shared by every context on the host. The
//! [`TieredCacheStore`] composes both with the compression service, the sync
//! bus and the metrics recorder.
//!
//! # Example
//!
//! ```ignore
//! let tier = Arc::new(LmdbTier::from_settings(&settings.persistent)?);
//! let store = TieredCacheStore::new(
//!     tier,
//!     Arc::new(CompressionService::new(CompressionConfig::from(&settings.worker))),
//!     Arc::new(SyncBus::open_global(&settings.namespace)),
//!     Arc::new(MetricsRecorder::new()?),
//!     StoreConfig::from(&settings),
//! );
//! ```
//!
//! [`CacheEntry`]: corpus_core::CacheEntry

pub mod in_memory_backend;
pub mod lmdb_backend;
pub mod memory_tier;
pub mod tiered;
pub mod traits;

pub use in_memory_backend::InMemoryTier;
pub use lmdb_backend::LmdbTier;
pub use memory_tier::MemoryTier;
pub use tiered::{CacheHit, StoreConfig, TieredCacheStore, WriteOutcome};
pub use traits::{footprint, EntryInfo, PersistentTier, TierUsage};
