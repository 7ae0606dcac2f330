//! Error types for corpus cache operations

use thiserror::Error;

/// Cache key canonicalization errors.
///
/// These indicate a programming error in the caller (malformed filters or
/// corpus type) and are the only errors a `load` caller is expected to handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Corpus type must not be empty")]
    EmptyCorpusType,

    #[error("Corpus type {corpus_type:?} contains reserved character {character:?}")]
    ReservedCharacter { corpus_type: String, character: char },

    #[error("Filter name must not be empty")]
    EmptyFilterName,

    #[error("Filter {name} has unsupported value: {reason}")]
    InvalidFilterValue { name: String, reason: String },

    #[error("Filters must be a JSON object, got {found}")]
    NotAnObject { found: String },
}

/// Compression service errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompressionError {
    #[error("Compression worker unavailable: {reason}")]
    WorkerUnavailable { reason: String },

    #[error("Worker request {id} timed out after {timeout_ms}ms")]
    Timeout { id: String, timeout_ms: u64 },

    #[error("Worker reported failure for request {id}: {message}")]
    Worker { id: String, message: String },

    #[error("Codec failure: {reason}")]
    Codec { reason: String },
}

/// Storage tier errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TierError {
    #[error("Storage quota exceeded: need {needed} bytes, budget is {budget} bytes")]
    QuotaExceeded { needed: u64, budget: u64 },

    #[error("Storage I/O failure: {reason}")]
    Io { reason: String },

    #[error("Corrupt entry for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Upstream fetch errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transport failure: {reason}")]
    Transport { reason: String },

    #[error("Upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse upstream corpus: {reason}")]
    Parse { reason: String },

    #[error("Invalid upstream URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl FetchError {
    /// Whether the retry policy should attempt the request again.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Parse { .. } | FetchError::InvalidUrl { .. } => false,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or CORPUS_CACHE_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Metrics registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("Failed to register metric {name}: {reason}")]
    Registration { name: &'static str, reason: String },

    #[error("Failed to encode metrics: {reason}")]
    Encode { reason: String },
}

/// Master error type for all corpus cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("Tier error: {0}")]
    Tier(#[from] TierError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),
}

/// Result type alias for corpus cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
