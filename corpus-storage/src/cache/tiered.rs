//! Two-tier corpus cache: uncompressed memory tier over a compressed
//! persistent tier.
//!
//! Reads walk memory, then persistent (decompressing and promoting on hit).
//! Writes compress, persist (evicting oldest entries under pressure), fill
//! the memory tier and broadcast a `saved` event. Operational failures never
//! reach the caller; they turn into misses, degraded write outcomes and
//! metrics error counts.

use std::sync::{Arc, Weak};
use std::time::Instant;

use corpus_core::{
    CacheEntry, CacheKey, CacheSettings, MutationAction, MutationEvent, Provenance, TierError,
};
use tracing::{debug, info, warn};

use super::memory_tier::MemoryTier;
use super::traits::{footprint, PersistentTier};
use crate::compression::CompressionService;
use crate::metrics::MetricsRecorder;
use crate::sync::{Subscription, SyncBus};

/// Configuration for the tiered store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Entries written with another version are treated as misses.
    pub schema_version: u32,
    /// Byte budget of the memory tier.
    pub memory_budget_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            memory_budget_bytes: 64 * 1024 * 1024, // 64 MiB
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn with_memory_budget(mut self, budget_bytes: u64) -> Self {
        self.memory_budget_bytes = budget_bytes;
        self
    }
}

impl From<&CacheSettings> for StoreConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            schema_version: settings.schema_version,
            memory_budget_bytes: settings.memory.budget_bytes,
        }
    }
}

/// A value served from one of the tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub value: Arc<str>,
    pub provenance: Provenance,
}

/// How far a `set` got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored in both tiers.
    Persisted,
    /// The persistent write failed even after eviction; only this context's
    /// memory tier holds the value.
    MemoryOnly,
    /// Compression failed; nothing was written.
    Aborted,
}

/// Memory + persistent cache for one context.
///
/// Several stores may share one persistent tier and one sync hub; each keeps
/// its own memory tier and drops entries from it when another store reports
/// a mutation.
///
/// # Example
///
/// ```ignore
/// let store = TieredCacheStore::new(tier, compression, bus, metrics, StoreConfig::default());
///
/// store.set(&key, &corpus_json).await;
/// if let Some(hit) = store.get(&key).await {
///     println!("served from {}", hit.provenance.as_str());
/// }
/// ```
pub struct TieredCacheStore<P: PersistentTier + ?Sized> {
    memory: Arc<MemoryTier>,
    persistent: Arc<P>,
    compression: Arc<CompressionService>,
    bus: Arc<SyncBus>,
    metrics: Arc<MetricsRecorder>,
    subscription: Subscription,
    config: StoreConfig,
}

impl<P: PersistentTier + ?Sized> TieredCacheStore<P> {
    /// Create a store and subscribe it to remote mutations on `bus`.
    pub fn new(
        persistent: Arc<P>,
        compression: Arc<CompressionService>,
        bus: Arc<SyncBus>,
        metrics: Arc<MetricsRecorder>,
        config: StoreConfig,
    ) -> Self {
        let memory = Arc::new(MemoryTier::new(config.memory_budget_bytes));
        let subscription = bus.subscribe(invalidate_on_remote(Arc::downgrade(&memory)));
        Self {
            memory,
            persistent,
            compression,
            bus,
            metrics,
            subscription,
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn persistent(&self) -> &P {
        &self.persistent
    }

    pub fn compression(&self) -> &CompressionService {
        &self.compression
    }

    pub fn bus(&self) -> &SyncBus {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Look a key up in memory, then in the persistent tier.
    ///
    /// `None` is a miss. A persistent hit is promoted into the memory tier
    /// unless a mutation was applied to this store while it was being read.
    /// An entry that cannot be decoded, or that carries another schema
    /// version, is deleted and reported as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheHit> {
        if let Some(value) = self.memory.get(key) {
            self.metrics.record_hit();
            debug!(key = %key, provenance = ?Provenance::Memory, "Cache hit");
            return Some(CacheHit {
                value,
                provenance: Provenance::Memory,
            });
        }

        // Anything invalidated from here on may make the persistent copy stale.
        let generation = self.memory.generation();
        let entry = match self.persistent.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.metrics.record_miss();
                debug!(key = %key, "Cache miss");
                return None;
            }
            Err(TierError::Corrupt { reason, .. }) => {
                self.discard_corrupt(key, &reason).await;
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Persistent tier read failed");
                self.metrics.record_error();
                self.metrics.record_miss();
                return None;
            }
        };

        if entry.schema_version != self.config.schema_version {
            debug!(
                key = %key,
                found = entry.schema_version,
                expected = self.config.schema_version,
                "Discarding entry written with another schema version"
            );
            if let Err(e) = self.persistent.delete(key).await {
                debug!(key = %key, error = %e, "Failed to delete outdated entry");
            }
            self.metrics.record_miss();
            return None;
        }

        let started = Instant::now();
        match self.compression.decompress(&entry.payload).await {
            Ok(Some(text)) => {
                self.metrics.record_decompression_time(elapsed_ms(started));
                let value: Arc<str> = Arc::from(text);
                self.memory
                    .insert_if_unchanged(key.clone(), Arc::clone(&value), generation);
                self.metrics.record_hit();
                debug!(key = %key, provenance = ?Provenance::Persistent, "Cache hit, promoted to memory");
                Some(CacheHit {
                    value,
                    provenance: Provenance::Persistent,
                })
            }
            Ok(None) => {
                self.discard_corrupt(key, "payload is not valid compressed text")
                    .await;
                None
            }
            Err(e) => {
                // Worker trouble says nothing about the entry itself.
                warn!(key = %key, error = %e, "Decompression failed, entry kept");
                self.metrics.record_error();
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Compress and store a value in both tiers, then broadcast `saved`.
    pub async fn set(&self, key: &CacheKey, value: &str) -> WriteOutcome {
        let started = Instant::now();
        let payload = match self.compression.compress(value).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Compression failed, write aborted");
                self.metrics.record_error();
                return WriteOutcome::Aborted;
            }
        };
        self.metrics.record_compression_time(elapsed_ms(started));

        let entry = CacheEntry::new(key.clone(), value, payload, self.config.schema_version);
        let outcome = match self.persist(&entry).await {
            Ok(()) => WriteOutcome::Persisted,
            Err(e) => {
                warn!(key = %key, error = %e, "Persistent write failed, caching in memory only");
                self.metrics.record_error();
                // A leftover older version would shadow this write for other contexts.
                if let Err(e) = self.persistent.delete(key).await {
                    debug!(key = %key, error = %e, "Failed to drop stale persistent entry");
                }
                WriteOutcome::MemoryOnly
            }
        };

        self.memory.insert(key.clone(), Arc::from(value));
        self.bus.publish(MutationEvent::saved(key.clone()));
        self.metrics.record_save();
        self.refresh_storage().await;

        debug!(
            key = %key,
            outcome = ?outcome,
            raw_bytes = entry.raw_size_bytes,
            compressed_bytes = entry.compressed_size_bytes,
            "Cache write"
        );
        outcome
    }

    /// Remove a key from both tiers and broadcast `deleted`.
    ///
    /// Invalidating an absent key is not an error; it still publishes
    /// exactly one event.
    pub async fn invalidate(&self, key: &CacheKey) {
        self.memory.remove(key);
        if let Err(e) = self.persistent.delete(key).await {
            warn!(key = %key, error = %e, "Failed to delete persistent entry");
            self.metrics.record_error();
        }
        self.bus.publish(MutationEvent::deleted(key.clone()));
        self.refresh_storage().await;
    }

    /// Empty both tiers and broadcast `cleared`.
    pub async fn clear(&self) {
        let dropped = self.memory.clear();
        match self.persistent.clear().await {
            Ok(removed) => info!(memory = dropped, persistent = removed, "Cache cleared"),
            Err(e) => {
                warn!(error = %e, "Failed to clear persistent tier");
                self.metrics.record_error();
            }
        }
        self.bus.publish(MutationEvent::cleared());
        self.refresh_storage().await;
    }

    /// Stop reacting to remote mutations.
    pub fn close(&self) {
        self.subscription.unsubscribe();
    }

    async fn persist(&self, entry: &CacheEntry) -> Result<(), TierError> {
        match self.persistent.put(entry).await {
            Ok(()) => return Ok(()),
            Err(e) => debug!(key = %entry.key, error = %e, "Persistent write failed, evicting"),
        }
        self.evict_for(entry).await?;
        self.persistent.put(entry).await
    }

    /// Delete the oldest entries until `entry` fits under the tier budget.
    async fn evict_for(&self, entry: &CacheEntry) -> Result<(), TierError> {
        let budget = self.persistent.budget_bytes();
        let incoming = footprint(entry);
        if incoming > budget {
            return Err(TierError::QuotaExceeded {
                needed: incoming,
                budget,
            });
        }

        let listing = self.persistent.entries().await?;
        let mut stored: u64 = listing
            .iter()
            .filter(|info| info.key != entry.key)
            .map(|info| info.size_bytes)
            .sum();

        let mut evicted = 0usize;
        for info in listing.iter().filter(|info| info.key != entry.key) {
            if stored + incoming <= budget {
                break;
            }
            if self.persistent.delete(&info.key).await? {
                stored = stored.saturating_sub(info.size_bytes);
                evicted += 1;
                debug!(key = %info.key, created_at = %info.created_at, "Evicted persistent entry");
            }
        }

        if evicted > 0 {
            info!(evicted, stored_bytes = stored, budget, "Evicted oldest persistent entries");
        }
        Ok(())
    }

    async fn discard_corrupt(&self, key: &CacheKey, reason: &str) {
        warn!(key = %key, reason, "Removing corrupted cache entry");
        if let Err(e) = self.persistent.delete(key).await {
            warn!(key = %key, error = %e, "Failed to delete corrupted entry");
        }
        self.metrics.record_error();
        self.metrics.record_miss();
        self.refresh_storage().await;
    }

    async fn refresh_storage(&self) {
        match self.persistent.usage().await {
            Ok(usage) => self
                .metrics
                .update_storage(usage.compressed_bytes, usage.compression_ratio()),
            Err(e) => debug!(error = %e, "Failed to read persistent tier usage"),
        }
    }
}

impl<P: PersistentTier + ?Sized> Drop for TieredCacheStore<P> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl<P: PersistentTier + ?Sized> std::fmt::Debug for TieredCacheStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCacheStore")
            .field("memory", &self.memory)
            .field("bus", &self.bus)
            .field("config", &self.config)
            .finish()
    }
}

/// Remote mutations only drop memory entries; the next read goes to the
/// persistent tier the other context already updated.
fn invalidate_on_remote(memory: Weak<MemoryTier>) -> impl Fn(&MutationEvent) + Send + Sync {
    move |event| {
        let Some(memory) = memory.upgrade() else {
            return;
        };
        match event.action() {
            MutationAction::Saved | MutationAction::Deleted => {
                memory.remove(event.cache_key());
            }
            MutationAction::Cleared => {
                memory.clear();
            }
        }
        debug!(key = %event.cache_key(), action = ?event.action(), "Applied remote mutation");
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryTier;
    use crate::compression::{
        compress_text, handle_request, CompressionConfig, WorkerAction, WorkerRequest,
        WorkerResponse, WorkerSpawner,
    };
    use crate::sync::SyncHub;
    use std::sync::mpsc;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    struct Harness {
        store: TieredCacheStore<InMemoryTier>,
        tier: Arc<InMemoryTier>,
        metrics: Arc<MetricsRecorder>,
    }

    fn harness(budget_bytes: u64) -> Harness {
        harness_with(budget_bytes, Arc::new(CompressionService::inline(CompressionConfig::default())))
    }

    fn harness_with(budget_bytes: u64, compression: Arc<CompressionService>) -> Harness {
        let tier = Arc::new(InMemoryTier::new(budget_bytes));
        let metrics = Arc::new(MetricsRecorder::new().expect("metrics"));
        let bus = Arc::new(SyncBus::open(Arc::new(SyncHub::new(16)), "corpus-test"));
        let store = TieredCacheStore::new(
            Arc::clone(&tier),
            compression,
            bus,
            Arc::clone(&metrics),
            StoreConfig::default(),
        );
        Harness {
            store,
            tier,
            metrics,
        }
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::from(name)
    }

    /// Worker that swallows requests, so every call times out.
    struct SilentSpawner;

    impl WorkerSpawner for SilentSpawner {
        fn spawn(
            &self,
            inbox: mpsc::Receiver<WorkerRequest>,
            outbox: UnboundedSender<WorkerResponse>,
        ) -> std::io::Result<()> {
            std::thread::spawn(move || {
                let _outbox = outbox;
                while inbox.recv().is_ok() {}
            });
            Ok(())
        }
    }

    /// Worker that answers decompress requests only after a delay.
    struct SlowDecompressSpawner(Duration);

    impl WorkerSpawner for SlowDecompressSpawner {
        fn spawn(
            &self,
            inbox: mpsc::Receiver<WorkerRequest>,
            outbox: UnboundedSender<WorkerResponse>,
        ) -> std::io::Result<()> {
            let delay = self.0;
            std::thread::spawn(move || {
                while let Ok(request) = inbox.recv() {
                    if request.action == WorkerAction::Decompress {
                        std::thread::sleep(delay);
                    }
                    if outbox.send(handle_request(&request)).is_err() {
                        return;
                    }
                }
            });
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_set_then_get_serves_memory() {
        let h = harness(1 << 20);
        let text = "x".repeat(1000);
        assert_eq!(h.store.set(&key("corpus:gaucho:v1"), &text).await, WriteOutcome::Persisted);

        let hit = h.store.get(&key("corpus:gaucho:v1")).await.expect("hit");
        assert_eq!(hit.provenance, Provenance::Memory);
        assert_eq!(hit.value.len(), 1000);

        let snapshot = h.metrics.metrics();
        assert_eq!(snapshot.saves, 1);
        assert_eq!(snapshot.hits, 1);
        assert!(snapshot.total_size > 0);
        assert!(snapshot.compression_ratio > 0.0);
    }

    #[tokio::test]
    async fn test_persistent_hit_is_promoted() {
        let h = harness(1 << 20);
        h.store.set(&key("k"), "persistent value").await;
        h.store.memory().clear();

        let first = h.store.get(&key("k")).await.expect("persistent hit");
        assert_eq!(first.provenance, Provenance::Persistent);
        assert_eq!(&*first.value, "persistent value");

        let second = h.store.get(&key("k")).await.expect("memory hit");
        assert_eq!(second.provenance, Provenance::Memory);
    }

    #[tokio::test]
    async fn test_miss_is_counted() {
        let h = harness(1 << 20);
        assert!(h.store.get(&key("absent")).await.is_none());
        assert_eq!(h.metrics.metrics().misses, 1);
        assert_eq!(h.metrics.cache_hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_corrupt_entry_removed() {
        let h = harness(1 << 20);
        let entry = CacheEntry::new(key("bad"), "raw", "%%% not a payload %%%".to_string(), 1);
        h.tier.put(&entry).await.expect("put");

        assert!(h.store.get(&key("bad")).await.is_none());
        assert!(!h.tier.contains(&key("bad")));

        let snapshot = h.metrics.metrics();
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.misses, 1);

        // Second read is a plain miss; no further error.
        assert!(h.store.get(&key("bad")).await.is_none());
        assert_eq!(h.metrics.metrics().errors, 1);
    }

    #[tokio::test]
    async fn test_other_schema_version_is_discarded() {
        let h = harness(1 << 20);
        let entry = CacheEntry::new(key("old"), "text", compress_text("text"), 7);
        h.tier.put(&entry).await.expect("put");

        assert!(h.store.get(&key("old")).await.is_none());
        assert!(!h.tier.contains(&key("old")));
        assert_eq!(h.metrics.metrics().errors, 0);
    }

    #[tokio::test]
    async fn test_eviction_removes_oldest_first() {
        let values = ["a".repeat(200), "b".repeat(200), "c".repeat(200)];
        let fp = values
            .iter()
            .map(|v| (2 + compress_text(v).len()) as u64)
            .max()
            .unwrap_or(0);
        let budget = fp * 2 + fp / 2;
        let h = harness(budget);

        for (name, value) in ["k1", "k2", "k3"].iter().zip(values.iter()) {
            assert_eq!(h.store.set(&key(name), value).await, WriteOutcome::Persisted);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(!h.tier.contains(&key("k1")));
        assert!(h.tier.contains(&key("k2")));
        assert!(h.tier.contains(&key("k3")));
        assert!(h.tier.usage().await.expect("usage").stored_bytes <= budget);
    }

    #[tokio::test]
    async fn test_oversized_write_degrades_to_memory_only() {
        let h = harness(16);
        let text = "a value much larger than sixteen bytes once compressed and encoded";
        assert_eq!(h.store.set(&key("big"), text).await, WriteOutcome::MemoryOnly);
        assert!(!h.tier.contains(&key("big")));

        let hit = h.store.get(&key("big")).await.expect("memory hit");
        assert_eq!(hit.provenance, Provenance::Memory);
        assert_eq!(h.metrics.metrics().errors, 1);
    }

    #[tokio::test]
    async fn test_compression_failure_aborts_write() {
        let compression = Arc::new(CompressionService::with_spawner(
            CompressionConfig::new().with_request_timeout(Duration::from_millis(50)),
            Arc::new(SilentSpawner),
        ));
        let h = harness_with(1 << 20, compression);

        assert_eq!(h.store.set(&key("k"), "value").await, WriteOutcome::Aborted);
        assert!(!h.tier.contains(&key("k")));
        assert!(!h.store.memory().contains(&key("k")));
        assert_eq!(h.metrics.metrics().errors, 1);
        assert_eq!(h.metrics.metrics().saves, 0);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let h = harness(1 << 20);
        h.store.set(&key("a"), "alpha").await;
        h.store.set(&key("b"), "beta").await;

        h.store.invalidate(&key("a")).await;
        h.store.invalidate(&key("a")).await;
        assert!(h.store.get(&key("a")).await.is_none());
        assert!(h.tier.contains(&key("b")));

        h.store.clear().await;
        assert!(h.tier.is_empty());
        assert!(h.store.memory().is_empty());
        assert_eq!(h.metrics.metrics().errors, 0);
    }

    #[tokio::test]
    async fn test_remote_events_drop_memory_entries() {
        let hub = Arc::new(SyncHub::new(16));
        let tier = Arc::new(InMemoryTier::new(1 << 20));
        let store = TieredCacheStore::new(
            Arc::clone(&tier),
            Arc::new(CompressionService::inline(CompressionConfig::default())),
            Arc::new(SyncBus::open(Arc::clone(&hub), "ns")),
            Arc::new(MetricsRecorder::new().expect("metrics")),
            StoreConfig::default(),
        );
        store.set(&key("k"), "value").await;
        assert!(store.memory().contains(&key("k")));

        let remote = SyncBus::open(hub, "ns");
        remote.publish(MutationEvent::saved(key("k")));

        for _ in 0..100 {
            if !store.memory().contains(&key("k")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!store.memory().contains(&key("k")));
        // Persistent copy is untouched.
        assert!(tier.contains(&key("k")));
    }

    #[tokio::test]
    async fn test_remote_write_during_read_is_not_shadowed() {
        let hub = Arc::new(SyncHub::new(16));
        let tier = Arc::new(InMemoryTier::new(1 << 20));
        let open = |compression: CompressionService| {
            TieredCacheStore::new(
                Arc::clone(&tier),
                Arc::new(compression),
                Arc::new(SyncBus::open(Arc::clone(&hub), "ns")),
                Arc::new(MetricsRecorder::new().expect("metrics")),
                StoreConfig::default(),
            )
        };
        let writer = open(CompressionService::inline(CompressionConfig::default()));
        let reader = open(CompressionService::with_spawner(
            CompressionConfig::default(),
            Arc::new(SlowDecompressSpawner(Duration::from_millis(300))),
        ));

        writer.set(&key("k"), "version one").await;
        let read_key = key("k");
        let (in_flight, ()) = tokio::join!(reader.get(&read_key), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.set(&key("k"), "version two").await;
        });
        let in_flight = in_flight.expect("persistent hit");
        assert_eq!(&*in_flight.value, "version one");
        assert!(!reader.memory().contains(&key("k")));

        let next = reader.get(&key("k")).await.expect("hit");
        assert_eq!(next.provenance, Provenance::Persistent);
        assert_eq!(&*next.value, "version two");
    }

    #[tokio::test]
    async fn test_close_unsubscribes() {
        let h = harness(1 << 20);
        assert_eq!(h.store.bus().handler_count(), 1);
        h.store.close();
        h.store.close();
        assert_eq!(h.store.bus().handler_count(), 0);
    }
}
