//! LMDB-backed persistent tier.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep compressed corpus
//! entries in a memory-mapped key-value store that survives restarts.
//!
//! # Record Format
//!
//! Key: the UTF-8 bytes of the [`CacheKey`]. Value: the JSON-serialized
//! [`CacheEntry`]. A value that fails to decode is reported as
//! [`TierError::Corrupt`] on read and listed with the earliest representable
//! creation time, so it is the first eviction candidate.
//!
//! # Budget
//!
//! The byte budget is enforced on top of the LMDB map size. Hitting either
//! limit yields [`TierError::QuotaExceeded`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corpus_core::{CacheEntry, CacheKey, PersistentSettings, TierError};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, MdbError};
use tracing::{debug, warn};

use super::traits::{footprint, EntryInfo, PersistentTier, TierUsage};

fn txn_error(e: heed::Error) -> TierError {
    TierError::Io {
        reason: format!("LMDB transaction failed: {}", e),
    }
}

/// A record as found on disk, decoded or not.
enum Stored {
    Entry(CacheEntry),
    /// Undecodable record and the bytes it occupies.
    Unreadable(u64),
}

impl Stored {
    fn read(key: &[u8], bytes: &[u8]) -> Self {
        match LmdbTier::decode(key, bytes) {
            Ok(entry) => Stored::Entry(entry),
            Err(_) => Stored::Unreadable((key.len() + bytes.len()) as u64),
        }
    }

    fn size(&self) -> u64 {
        match self {
            Stored::Entry(entry) => footprint(entry),
            Stored::Unreadable(size) => *size,
        }
    }

    fn release(self, usage: &mut TierUsage) {
        match self {
            Stored::Entry(entry) => usage.remove(&entry),
            Stored::Unreadable(size) => {
                usage.entries = usage.entries.saturating_sub(1);
                usage.stored_bytes = usage.stored_bytes.saturating_sub(size);
            }
        }
    }
}

/// Persistent tier stored in an LMDB environment.
///
/// # Example
///
/// ```ignore
/// use corpus_storage::cache::LmdbTier;
///
/// let tier = LmdbTier::open("/var/cache/corpus", 512, 256 * 1024 * 1024)?;
/// tier.put(&entry).await?;
/// let cached = tier.get(&entry.key).await?;
/// ```
pub struct LmdbTier {
    env: Env,
    db: Database<Bytes, Bytes>,
    budget_bytes: u64,
    map_size_bytes: u64,
    usage: Mutex<TierUsage>,
}

impl LmdbTier {
    /// Open (or create) the tier.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `map_size_mb` - Maximum size of the LMDB map in megabytes
    /// * `budget_bytes` - Byte budget for stored entries
    pub fn open<P: AsRef<Path>>(
        path: P,
        map_size_mb: usize,
        budget_bytes: u64,
    ) -> Result<Self, TierError> {
        std::fs::create_dir_all(&path).map_err(|e| TierError::Io {
            reason: format!("failed to create {}: {}", path.as_ref().display(), e),
        })?;

        let map_size = map_size_mb * 1024 * 1024;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| TierError::Io {
            reason: format!("failed to open LMDB environment: {}", e),
        })?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;

        let tier = Self {
            env,
            db,
            budget_bytes,
            map_size_bytes: map_size as u64,
            usage: Mutex::new(TierUsage::default()),
        };
        let usage = tier.scan_usage()?;
        debug!(entries = usage.entries, stored_bytes = usage.stored_bytes, "Opened LMDB tier");
        *tier.accounted() = usage;
        Ok(tier)
    }

    pub fn from_settings(settings: &PersistentSettings) -> Result<Self, TierError> {
        Self::open(&settings.path, settings.map_size_mb, settings.budget_bytes)
    }

    pub fn map_size_bytes(&self) -> u64 {
        self.map_size_bytes
    }

    fn accounted(&self) -> MutexGuard<'_, TierUsage> {
        self.usage.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn decode(key: &[u8], bytes: &[u8]) -> Result<CacheEntry, TierError> {
        serde_json::from_slice(bytes).map_err(|e| TierError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: e.to_string(),
        })
    }

    fn scan_usage(&self) -> Result<TierUsage, TierError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut usage = TierUsage::default();
        for result in self.db.iter(&rtxn).map_err(txn_error)? {
            let (key, bytes) = result.map_err(txn_error)?;
            match Stored::read(key, bytes) {
                Stored::Entry(entry) => usage.add(&entry),
                Stored::Unreadable(size) => {
                    usage.entries += 1;
                    usage.stored_bytes += size;
                }
            }
        }
        Ok(usage)
    }

    fn read_raw(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, TierError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let bytes = self
            .db
            .get(&rtxn, key.as_str().as_bytes())
            .map_err(txn_error)?;
        Ok(bytes.map(<[u8]>::to_vec))
    }
}

#[async_trait]
impl PersistentTier for LmdbTier {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, TierError> {
        match self.read_raw(key)? {
            Some(bytes) => Self::decode(key.as_str().as_bytes(), &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), TierError> {
        let encoded_key = entry.key.as_str().as_bytes();
        let value = serde_json::to_vec(entry).map_err(|e| TierError::Io {
            reason: format!("failed to serialize entry: {}", e),
        })?;

        // The usage guard is held for the whole transaction so the budget
        // check and the commit see the same totals.
        let mut usage = self.accounted();
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let previous = self
            .db
            .get(&wtxn, encoded_key)
            .map_err(txn_error)?
            .map(|bytes| Stored::read(encoded_key, bytes));

        let replaced = previous.as_ref().map_or(0, Stored::size);
        let needed = usage.stored_bytes.saturating_sub(replaced) + footprint(entry);
        if needed > self.budget_bytes {
            return Err(TierError::QuotaExceeded {
                needed,
                budget: self.budget_bytes,
            });
        }

        let written = match self.db.put(&mut wtxn, encoded_key, &value) {
            Ok(()) => wtxn.commit(),
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {}
            Err(heed::Error::Mdb(MdbError::MapFull)) => {
                warn!(key = %entry.key, "LMDB map full");
                return Err(TierError::QuotaExceeded {
                    needed,
                    budget: self.budget_bytes.min(self.map_size_bytes),
                });
            }
            Err(e) => return Err(txn_error(e)),
        }

        if let Some(previous) = previous {
            previous.release(&mut usage);
        }
        usage.add(entry);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, TierError> {
        let encoded_key = key.as_str().as_bytes();
        let mut usage = self.accounted();
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let previous = self
            .db
            .get(&wtxn, encoded_key)
            .map_err(txn_error)?
            .map(|bytes| Stored::read(encoded_key, bytes));
        let deleted = self.db.delete(&mut wtxn, encoded_key).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;

        if let Some(previous) = previous {
            previous.release(&mut usage);
        }
        Ok(deleted)
    }

    async fn clear(&self) -> Result<u64, TierError> {
        let mut usage = self.accounted();
        let count = usage.entries;
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db.clear(&mut wtxn).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        *usage = TierUsage::default();
        Ok(count)
    }

    async fn entries(&self) -> Result<Vec<EntryInfo>, TierError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut listing = Vec::new();
        for result in self.db.iter(&rtxn).map_err(txn_error)? {
            let (key, bytes) = result.map_err(txn_error)?;
            let info = match Self::decode(key, bytes) {
                Ok(entry) => EntryInfo {
                    size_bytes: footprint(&entry),
                    key: entry.key,
                    created_at: entry.created_at,
                },
                Err(_) => EntryInfo {
                    key: CacheKey::from(String::from_utf8_lossy(key).into_owned()),
                    created_at: DateTime::<Utc>::MIN_UTC,
                    size_bytes: (key.len() + bytes.len()) as u64,
                },
            };
            listing.push(info);
        }
        listing.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        Ok(listing)
    }

    async fn usage(&self) -> Result<TierUsage, TierError> {
        Ok(*self.accounted())
    }

    fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }
}
