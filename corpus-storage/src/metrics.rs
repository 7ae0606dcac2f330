//! Cache effectiveness metrics.
//!
//! One recorder per cache context, shared by the tiers and the loader.
//! Nothing is persisted; [`MetricsRecorder::reset`] zeroes everything.
//! Each recorder exports its values through a Prometheus registry.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use corpus_core::MetricsError;
use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;

/// Capacity of the load-time sliding window.
pub const LOAD_TIME_WINDOW: usize = 100;

/// Point-in-time view of the recorder.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub saves: u64,
    pub errors: u64,
    /// Mean of the load-time window, in milliseconds.
    pub avg_load_time: f64,
    /// Smoothed compression time, in milliseconds.
    pub avg_compression_time: f64,
    /// Smoothed decompression time, in milliseconds.
    pub avg_decompression_time: f64,
    /// Bytes held by the persistent tier.
    pub total_size: u64,
    /// Compressed bytes over raw bytes in the persistent tier.
    pub compression_ratio: f64,
}

impl MetricsSnapshot {
    /// Hit rate as a fraction in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Register a collector, mapping failures to [`MetricsError`].
fn register<C>(
    registry: &Registry,
    name: &'static str,
    collector: prometheus::Result<C>,
) -> Result<C, MetricsError>
where
    C: Collector + Clone + 'static,
{
    let registration = |e: prometheus::Error| MetricsError::Registration {
        name,
        reason: e.to_string(),
    };
    let collector = collector.map_err(registration)?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(registration)?;
    Ok(collector)
}

/// Counters and timing statistics for one cache context.
///
/// Values live in Prometheus collectors registered in a registry the
/// recorder owns, so a host can scrape [`MetricsRecorder::encode_text`] or
/// merge [`MetricsRecorder::registry`] into its own exporter.
pub struct MetricsRecorder {
    registry: Registry,
    hits: IntCounter,
    misses: IntCounter,
    saves: IntCounter,
    errors: IntCounter,
    avg_load_time: Gauge,
    avg_compression_time: Gauge,
    avg_decompression_time: Gauge,
    storage_bytes: IntGauge,
    compression_ratio: Gauge,
    /// Load-time window; also serializes the smoothed gauge updates.
    load_times: Mutex<VecDeque<f64>>,
}

impl MetricsRecorder {
    /// Create a recorder with its own registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        Ok(Self {
            hits: register(
                &registry,
                "corpus_cache_hits_total",
                IntCounter::new("corpus_cache_hits_total", "Reads served from a cache tier"),
            )?,
            misses: register(
                &registry,
                "corpus_cache_misses_total",
                IntCounter::new("corpus_cache_misses_total", "Reads not served by any tier"),
            )?,
            saves: register(
                &registry,
                "corpus_cache_saves_total",
                IntCounter::new("corpus_cache_saves_total", "Values written to the cache"),
            )?,
            errors: register(
                &registry,
                "corpus_cache_errors_total",
                IntCounter::new("corpus_cache_errors_total", "Absorbed cache failures"),
            )?,
            avg_load_time: register(
                &registry,
                "corpus_cache_avg_load_time_ms",
                Gauge::new(
                    "corpus_cache_avg_load_time_ms",
                    "Mean load time over the last 100 loads in milliseconds",
                ),
            )?,
            avg_compression_time: register(
                &registry,
                "corpus_cache_avg_compression_time_ms",
                Gauge::new(
                    "corpus_cache_avg_compression_time_ms",
                    "Smoothed compression time in milliseconds",
                ),
            )?,
            avg_decompression_time: register(
                &registry,
                "corpus_cache_avg_decompression_time_ms",
                Gauge::new(
                    "corpus_cache_avg_decompression_time_ms",
                    "Smoothed decompression time in milliseconds",
                ),
            )?,
            storage_bytes: register(
                &registry,
                "corpus_cache_storage_bytes",
                IntGauge::new(
                    "corpus_cache_storage_bytes",
                    "Compressed bytes held by the persistent tier",
                ),
            )?,
            compression_ratio: register(
                &registry,
                "corpus_cache_compression_ratio",
                Gauge::new(
                    "corpus_cache_compression_ratio",
                    "Compressed over raw bytes in the persistent tier",
                ),
            )?,
            registry,
            load_times: Mutex::new(VecDeque::with_capacity(LOAD_TIME_WINDOW)),
        })
    }

    pub fn record_hit(&self) {
        self.hits.inc();
    }

    pub fn record_miss(&self) {
        self.misses.inc();
    }

    pub fn record_save(&self) {
        self.saves.inc();
    }

    pub fn record_error(&self) {
        self.errors.inc();
    }

    /// Push a load time into the window, evicting the oldest sample when full.
    pub fn record_load_time(&self, ms: f64) {
        let mut window = self.load_times();
        if window.len() == LOAD_TIME_WINDOW {
            window.pop_front();
        }
        window.push_back(ms);
        let sum: f64 = window.iter().sum();
        self.avg_load_time.set(sum / window.len() as f64);
    }

    pub fn record_compression_time(&self, ms: f64) {
        let _window = self.load_times();
        self.avg_compression_time
            .set(smooth(self.avg_compression_time.get(), ms));
    }

    pub fn record_decompression_time(&self, ms: f64) {
        let _window = self.load_times();
        self.avg_decompression_time
            .set(smooth(self.avg_decompression_time.get(), ms));
    }

    pub fn update_storage(&self, total_size: u64, compression_ratio: f64) {
        self.storage_bytes
            .set(i64::try_from(total_size).unwrap_or(i64::MAX));
        self.compression_ratio.set(compression_ratio);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.get(),
            misses: self.misses.get(),
            saves: self.saves.get(),
            errors: self.errors.get(),
            avg_load_time: self.avg_load_time.get(),
            avg_compression_time: self.avg_compression_time.get(),
            avg_decompression_time: self.avg_decompression_time.get(),
            total_size: u64::try_from(self.storage_bytes.get()).unwrap_or(0),
            compression_ratio: self.compression_ratio.get(),
        }
    }

    /// Hit rate as a percentage; 0 before any hit or miss.
    pub fn cache_hit_rate(&self) -> f64 {
        self.metrics().hit_rate() * 100.0
    }

    /// Number of samples currently in the load-time window.
    pub fn load_time_samples(&self) -> usize {
        self.load_times().len()
    }

    pub fn reset(&self) {
        let mut window = self.load_times();
        window.clear();
        for counter in [&self.hits, &self.misses, &self.saves, &self.errors] {
            counter.reset();
        }
        for gauge in [
            &self.avg_load_time,
            &self.avg_compression_time,
            &self.avg_decompression_time,
            &self.compression_ratio,
        ] {
            gauge.set(0.0);
        }
        self.storage_bytes.set(0);
    }

    /// Registry holding this recorder's collectors.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::Encode {
                reason: e.to_string(),
            })?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encode {
            reason: e.to_string(),
        })
    }

    fn load_times(&self) -> MutexGuard<'_, VecDeque<f64>> {
        self.load_times
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("snapshot", &self.metrics())
            .finish()
    }
}

/// Halve toward the newest sample; the first sample is taken as-is.
fn smooth(avg: f64, sample: f64) -> f64 {
    if avg == 0.0 {
        sample
    } else {
        (avg + sample) / 2.0
    }
}
