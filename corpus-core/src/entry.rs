//! Persistent cache entries and read provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::CacheKey;

/// Which tier satisfied a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Served from the in-process memory tier.
    Memory,
    /// Served from the persistent tier after decompression.
    Persistent,
    /// Fetched from the upstream data source.
    Network,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Memory => "memory",
            Provenance::Persistent => "persistent",
            Provenance::Network => "network",
        }
    }
}

/// A compressed corpus as stored in the persistent tier.
///
/// Entries are replaced wholesale; there is no partial update.
/// `compressed_size_bytes <= raw_size_bytes` is not guaranteed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Compressed text produced by the compression codec.
    pub payload: String,
    pub raw_size_bytes: u64,
    pub compressed_size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
}

impl CacheEntry {
    /// Build an entry for a freshly compressed value, stamped now.
    pub fn new(key: CacheKey, raw: &str, payload: String, schema_version: u32) -> Self {
        Self {
            key,
            raw_size_bytes: raw.len() as u64,
            compressed_size_bytes: payload.len() as u64,
            payload,
            created_at: Utc::now(),
            schema_version,
        }
    }

    /// Compressed size divided by raw size; 0 for an empty raw value.
    pub fn compression_ratio(&self) -> f64 {
        if self.raw_size_bytes == 0 {
            0.0
        } else {
            self.compressed_size_bytes as f64 / self.raw_size_bytes as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_sizes() {
        let entry = CacheEntry::new(
            CacheKey::from("corpus:gaucho:v1"),
            "abcdefgh",
            "xyzw".to_string(),
            1,
        );
        assert_eq!(entry.raw_size_bytes, 8);
        assert_eq!(entry.compressed_size_bytes, 4);
        assert!((entry.compression_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = CacheEntry::new(CacheKey::from("k"), "", "AAAAAA==".to_string(), 3);
        let json = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(json["key"], "k");
        assert_eq!(json["rawSizeBytes"], 0);
        assert_eq!(json["schemaVersion"], 3);
        assert!(json.get("createdAt").is_some());
        assert_eq!(entry.compression_ratio(), 0.0);
    }

    #[test]
    fn test_provenance_serde() {
        let json = serde_json::to_string(&Provenance::Persistent).expect("serialize");
        assert_eq!(json, "\"persistent\"");
        assert_eq!(Provenance::Network.as_str(), "network");
    }
}
