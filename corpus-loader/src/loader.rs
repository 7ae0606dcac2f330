//! The caller-facing corpus loader.
//!
//! `load` walks the tiered store and falls back to the upstream source on a
//! full miss. Concurrent loads of one key share a single in-flight fetch;
//! the fetched corpus is written back to the store without making the
//! caller wait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use corpus_core::{CacheKey, CacheResult, CacheSettings, Corpus, FilterSet, Provenance};
use corpus_storage::{
    CompressionConfig, CompressionService, LmdbTier, MetricsRecorder, PersistentTier, StoreConfig,
    SyncBus, TieredCacheStore,
};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::parse::parse_corpus;
use crate::retry::RetryPolicy;
use crate::source::{CorpusSource, HttpCorpusSource};

type InFlight = Shared<BoxFuture<'static, CacheResult<Arc<Corpus>>>>;

/// Loader behavior switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Write fetched corpora back on a spawned task instead of before
    /// returning.
    pub persist_in_background: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            persist_in_background: true,
        }
    }
}

impl LoaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persist_in_background(mut self, enabled: bool) -> Self {
        self.persist_in_background = enabled;
        self
    }
}

/// A corpus and the tier that served it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedCorpus {
    pub corpus: Arc<Corpus>,
    pub provenance: Provenance,
}

struct LoaderInner<P: PersistentTier + ?Sized, S: CorpusSource + ?Sized> {
    store: Arc<TieredCacheStore<P>>,
    source: Arc<S>,
    retry: RetryPolicy,
    config: LoaderConfig,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
}

/// Loads corpora through the tiered cache.
///
/// # Example
///
/// ```ignore
/// let loader = CorpusLoader::open(&CacheSettings::load()?)?;
/// let filters = FilterSet::new().with("region", ["pampa"]);
///
/// let loaded = loader.load("gaucho", &filters).await?;
/// println!("{} units from {}", loaded.corpus.len(), loaded.provenance.as_str());
///
/// loader.close();
/// ```
pub struct CorpusLoader<P: PersistentTier + ?Sized, S: CorpusSource + ?Sized> {
    inner: Arc<LoaderInner<P, S>>,
}

impl<P: PersistentTier + ?Sized, S: CorpusSource + ?Sized> Clone for CorpusLoader<P, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl CorpusLoader<LmdbTier, HttpCorpusSource> {
    /// Wire up a loader from settings: LMDB persistent tier, worker-thread
    /// compression, the process-wide sync hub and an HTTP source.
    pub fn open(settings: &CacheSettings) -> CacheResult<Self> {
        settings.validate()?;

        let tier = Arc::new(LmdbTier::from_settings(&settings.persistent)?);
        let store = TieredCacheStore::new(
            tier,
            Arc::new(CompressionService::new(CompressionConfig::from(&settings.worker))),
            Arc::new(SyncBus::open_global(settings.namespace.clone())),
            Arc::new(MetricsRecorder::new()?),
            StoreConfig::from(settings),
        );
        let source = HttpCorpusSource::from_settings(&settings.fetch)?;

        info!(
            namespace = %settings.namespace,
            schema_version = settings.schema_version,
            path = %settings.persistent.path.display(),
            "Corpus loader opened"
        );
        Ok(Self::new(
            Arc::new(store),
            Arc::new(source),
            RetryPolicy::from(&settings.fetch),
            LoaderConfig::default(),
        ))
    }
}

impl<P, S> CorpusLoader<P, S>
where
    P: PersistentTier + ?Sized + 'static,
    S: CorpusSource + ?Sized + 'static,
{
    pub fn new(
        store: Arc<TieredCacheStore<P>>,
        source: Arc<S>,
        retry: RetryPolicy,
        config: LoaderConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                store,
                source,
                retry,
                config,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<TieredCacheStore<P>> {
        &self.inner.store
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        self.inner.store.metrics()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// Fetches currently shared by concurrent loads.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight().len()
    }

    /// Load a corpus, reporting which tier served it.
    ///
    /// Fails only on malformed input (a [`KeyError`](corpus_core::KeyError))
    /// or when nothing is cached and the upstream fetch fails.
    pub async fn load(&self, corpus_type: &str, filters: &FilterSet) -> CacheResult<LoadedCorpus> {
        let started = Instant::now();
        let filters = filters.canonicalize()?;
        let key = CacheKey::derive(corpus_type, &filters, self.inner.store.config().schema_version)?;
        // The key is derived from the trimmed type; fetch and label with it too.
        let corpus_type = corpus_type.trim();

        let loaded = match self.inner.cached(corpus_type, &key).await {
            Some(loaded) => loaded,
            None => {
                let corpus = self.inner.fetch_shared(corpus_type, &filters, &key).await?;
                LoadedCorpus {
                    corpus,
                    provenance: Provenance::Network,
                }
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics().record_load_time(elapsed_ms);
        debug!(key = %key, provenance = ?loaded.provenance, elapsed_ms, "Corpus loaded");
        Ok(loaded)
    }

    /// Drop a corpus from every tier of this cache.
    pub async fn invalidate(&self, corpus_type: &str, filters: &FilterSet) -> CacheResult<()> {
        let key = CacheKey::derive(corpus_type, filters, self.inner.store.config().schema_version)?;
        self.inner.store.invalidate(&key).await;
        Ok(())
    }

    /// Release the sync subscription, the bus endpoint and the worker.
    pub fn close(&self) {
        let store = &self.inner.store;
        store.close();
        store.bus().close();
        store.compression().shutdown();
    }
}

impl<P, S> LoaderInner<P, S>
where
    P: PersistentTier + ?Sized + 'static,
    S: CorpusSource + ?Sized + 'static,
{
    fn in_flight(&self) -> MutexGuard<'_, HashMap<CacheKey, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn cached(&self, corpus_type: &str, key: &CacheKey) -> Option<LoadedCorpus> {
        let hit = self.store.get(key).await?;
        match serde_json::from_str::<Corpus>(&hit.value) {
            Ok(corpus) => Some(LoadedCorpus {
                corpus: Arc::new(corpus),
                provenance: hit.provenance,
            }),
            Err(e) => {
                warn!(key = %key, corpus_type, error = %e, "Cached corpus is unreadable, invalidating");
                self.store.metrics().record_error();
                self.store.invalidate(key).await;
                None
            }
        }
    }

    /// Join the in-flight fetch for `key`, or start one.
    async fn fetch_shared(
        self: &Arc<Self>,
        corpus_type: &str,
        filters: &FilterSet,
        key: &CacheKey,
    ) -> CacheResult<Arc<Corpus>> {
        let fetch = {
            let mut in_flight = self.in_flight();
            match in_flight.get(key) {
                Some(existing) => {
                    debug!(key = %key, "Joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    let fetch = Arc::clone(self)
                        .fetch_and_store(corpus_type.to_string(), filters.clone(), key.clone())
                        .boxed()
                        .shared();
                    in_flight.insert(key.clone(), fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    async fn fetch_and_store(
        self: Arc<Self>,
        corpus_type: String,
        filters: FilterSet,
        key: CacheKey,
    ) -> CacheResult<Arc<Corpus>> {
        let fetched = self
            .retry
            .run(|| self.source.fetch(&corpus_type, &filters))
            .await
            .and_then(|body| parse_corpus(&corpus_type, &body).map(|corpus| (corpus, body.len())));

        let (corpus, body_bytes) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                self.in_flight().remove(&key);
                warn!(key = %key, error = %e, "Corpus fetch failed");
                self.store.metrics().record_error();
                return Err(e.into());
            }
        };
        info!(key = %key, units = corpus.len(), body_bytes, "Fetched corpus from network");

        let corpus = Arc::new(corpus);
        self.write_back(key, Arc::clone(&corpus)).await;
        Ok(corpus)
    }

    /// Store the fetched corpus. The in-flight entry stays until the write
    /// lands, so loads arriving meanwhile reuse the finished fetch.
    async fn write_back(self: &Arc<Self>, key: CacheKey, corpus: Arc<Corpus>) {
        let serialized = match serde_json::to_string(corpus.as_ref()) {
            Ok(serialized) => serialized,
            Err(e) => {
                self.in_flight().remove(&key);
                warn!(key = %key, error = %e, "Failed to serialize corpus, not caching");
                return;
            }
        };

        if self.config.persist_in_background {
            if let Ok(handle) = Handle::try_current() {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    inner.store.set(&key, &serialized).await;
                    inner.in_flight().remove(&key);
                });
                return;
            }
        }
        self.store.set(&key, &serialized).await;
        self.in_flight().remove(&key);
    }
}
