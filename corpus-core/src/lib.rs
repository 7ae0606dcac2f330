//! Corpus Core - Cache Data Types
//!
//! Pure data structures shared by the storage tiers and the loader:
//! cache keys, persistent entries, the corpus shape, mutation events,
//! configuration and the error taxonomy. No I/O beyond reading a config file.

pub mod config;
pub mod corpus;
pub mod entry;
pub mod error;
pub mod event;
pub mod key;

pub use config::{
    CacheSettings, FetchSettings, MemorySettings, PersistentSettings, WorkerSettings,
    CONFIG_ENV_VAR,
};
pub use corpus::{Corpus, TextUnit};
pub use entry::{CacheEntry, Provenance};
pub use error::{
    CacheError, CacheResult, CompressionError, ConfigError, FetchError, KeyError, MetricsError,
    TierError,
};
pub use event::{MutationAction, MutationEvent};
pub use key::{CacheKey, FilterSet};
