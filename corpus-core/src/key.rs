//! Cache keys derived from corpus type, filter set and schema version.
//!
//! A [`CacheKey`] is a plain string, but the only checked way to build one is
//! [`CacheKey::derive`], which canonicalizes the [`FilterSet`] first. Two
//! filter sets that differ only in ordering, surrounding whitespace or
//! duplicate values produce the same key.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::KeyError;

/// Prefix shared by every derived key.
const KEY_PREFIX: &str = "corpus";

/// Characters that would make a derived key ambiguous.
const RESERVED: &[char] = &[':', '*'];

/// Number of hex characters of the filter digest kept in the key.
const DIGEST_HEX_LEN: usize = 16;

/// Wildcard key carried by `cleared` mutation events.
const WILDCARD: &str = "*";

/// The set of filters applied to a corpus request.
///
/// Each filter name maps to a set of accepted values. Construction is
/// permissive; validation happens in [`FilterSet::canonicalize`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    filters: BTreeMap<String, BTreeSet<String>>,
}

impl FilterSet {
    /// Create an empty filter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add values for a filter name, merging with any values already present.
    pub fn with<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.insert(name, values);
        self
    }

    /// Add values for a filter name in place.
    pub fn insert<I, V>(&mut self, name: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.filters
            .entry(name.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
    }

    /// Build a filter set from a JSON object.
    ///
    /// Values may be strings, numbers, booleans, or arrays of those.
    /// Nested objects, nested arrays and nulls are rejected.
    pub fn from_json(value: &Value) -> Result<Self, KeyError> {
        let object = value.as_object().ok_or_else(|| KeyError::NotAnObject {
            found: json_kind(value).to_string(),
        })?;

        let mut set = FilterSet::new();
        for (name, raw) in object {
            let values = match raw {
                Value::Array(items) => items
                    .iter()
                    .map(|item| scalar_to_string(name, item))
                    .collect::<Result<Vec<_>, _>>()?,
                other => vec![scalar_to_string(name, other)?],
            };
            set.insert(name.clone(), values);
        }
        Ok(set)
    }

    /// Whether no filters are applied.
    pub fn is_empty(&self) -> bool {
        self.filters.values().all(|values| values.is_empty())
    }

    /// Iterate filter names and their values in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.filters.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Produce the canonical form: names and values trimmed, empty value
    /// sets dropped. Fails on empty names or values.
    pub fn canonicalize(&self) -> Result<FilterSet, KeyError> {
        let mut canonical: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, values) in &self.filters {
            let name = name.trim();
            if name.is_empty() {
                return Err(KeyError::EmptyFilterName);
            }
            let mut cleaned = BTreeSet::new();
            for value in values {
                let value = value.trim();
                if value.is_empty() {
                    return Err(KeyError::InvalidFilterValue {
                        name: name.to_string(),
                        reason: "empty value".to_string(),
                    });
                }
                cleaned.insert(value.to_string());
            }
            if !cleaned.is_empty() {
                canonical.entry(name.to_string()).or_default().extend(cleaned);
            }
        }
        Ok(FilterSet { filters: canonical })
    }

    /// Stable digest of the canonical filter set.
    fn digest(&self) -> String {
        // BTreeMap/BTreeSet serialize in sorted order, so the JSON is canonical.
        let canonical = serde_json::to_vec(&self.filters).unwrap_or_default();
        let hash = Sha256::digest(&canonical);
        let mut hex = hex::encode(hash);
        hex.truncate(DIGEST_HEX_LEN);
        hex
    }
}

fn scalar_to_string(name: &str, value: &Value) -> Result<String, KeyError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(KeyError::InvalidFilterValue {
            name: name.to_string(),
            reason: format!("unsupported {} value", json_kind(other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A cache key uniquely derived from {corpus type, filter set, schema version}.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from its inputs.
    ///
    /// Format: `corpus:{type}:v{schema}` with no filters, otherwise
    /// `corpus:{type}:v{schema}:{digest}`.
    pub fn derive(
        corpus_type: &str,
        filters: &FilterSet,
        schema_version: u32,
    ) -> Result<Self, KeyError> {
        let corpus_type = corpus_type.trim();
        if corpus_type.is_empty() {
            return Err(KeyError::EmptyCorpusType);
        }
        if let Some(character) = corpus_type.chars().find(|c| RESERVED.contains(c)) {
            return Err(KeyError::ReservedCharacter {
                corpus_type: corpus_type.to_string(),
                character,
            });
        }

        let canonical = filters.canonicalize()?;
        let base = format!("{KEY_PREFIX}:{corpus_type}:v{schema_version}");
        if canonical.is_empty() {
            Ok(Self(base))
        } else {
            Ok(Self(format!("{base}:{}", canonical.digest())))
        }
    }

    /// The wildcard key used by `cleared` events.
    pub fn wildcard() -> Self {
        Self(WILDCARD.to_string())
    }

    /// Whether this is the wildcard key.
    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD
    }

    /// Borrow the key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_without_filters() {
        let key = CacheKey::derive("gaucho", &FilterSet::new(), 1).expect("derive");
        assert_eq!(key.as_str(), "corpus:gaucho:v1");
    }

    #[test]
    fn test_key_with_filters_has_digest() {
        let filters = FilterSet::new().with("country", ["AR"]);
        let key = CacheKey::derive("gaucho", &filters, 2).expect("derive");
        assert!(key.as_str().starts_with("corpus:gaucho:v2:"));
        assert_eq!(key.as_str().len(), "corpus:gaucho:v2:".len() + DIGEST_HEX_LEN);
    }

    #[test]
    fn test_filter_order_and_whitespace_do_not_matter() {
        let a = FilterSet::new()
            .with("country", ["AR", "UY"])
            .with("genre", ["poem"]);
        let b = FilterSet::new()
            .with(" genre ", ["poem", "poem"])
            .with("country", [" UY", "AR "]);
        assert_eq!(
            CacheKey::derive("gaucho", &a, 1).expect("derive a"),
            CacheKey::derive("gaucho", &b, 1).expect("derive b")
        );
    }

    #[test]
    fn test_different_inputs_give_different_keys() {
        let a = FilterSet::new().with("country", ["AR"]);
        let b = FilterSet::new().with("country", ["UY"]);
        let ka = CacheKey::derive("gaucho", &a, 1).expect("derive");
        assert_ne!(ka, CacheKey::derive("gaucho", &b, 1).expect("derive"));
        assert_ne!(ka, CacheKey::derive("gaucho", &a, 2).expect("derive"));
        assert_ne!(ka, CacheKey::derive("tango", &a, 1).expect("derive"));
    }

    #[test]
    fn test_empty_value_set_equals_no_filter() {
        let empty: [&str; 0] = [];
        let with_empty = FilterSet::new().with("country", empty);
        assert_eq!(
            CacheKey::derive("gaucho", &with_empty, 1).expect("derive"),
            CacheKey::derive("gaucho", &FilterSet::new(), 1).expect("derive")
        );
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        assert_eq!(
            CacheKey::derive("  ", &FilterSet::new(), 1),
            Err(KeyError::EmptyCorpusType)
        );
        assert!(matches!(
            CacheKey::derive("a:b", &FilterSet::new(), 1),
            Err(KeyError::ReservedCharacter { character: ':', .. })
        ));
        assert_eq!(
            CacheKey::derive("gaucho", &FilterSet::new().with(" ", ["x"]), 1),
            Err(KeyError::EmptyFilterName)
        );
        assert!(matches!(
            CacheKey::derive("gaucho", &FilterSet::new().with("country", [" "]), 1),
            Err(KeyError::InvalidFilterValue { .. })
        ));
    }

    #[test]
    fn test_from_json() {
        let filters = FilterSet::from_json(&json!({
            "country": ["AR", "UY"],
            "year": 1872,
            "verse": true
        }))
        .expect("valid filters");
        let expected = FilterSet::new()
            .with("country", ["UY", "AR"])
            .with("year", ["1872"])
            .with("verse", ["true"]);
        assert_eq!(filters, expected);

        assert!(matches!(
            FilterSet::from_json(&json!(["AR"])),
            Err(KeyError::NotAnObject { .. })
        ));
        assert!(matches!(
            FilterSet::from_json(&json!({"country": null})),
            Err(KeyError::InvalidFilterValue { .. })
        ));
        assert!(matches!(
            FilterSet::from_json(&json!({"country": [{"nested": 1}]})),
            Err(KeyError::InvalidFilterValue { .. })
        ));
    }

    #[test]
    fn test_wildcard() {
        assert!(CacheKey::wildcard().is_wildcard());
        assert!(!CacheKey::from("corpus:gaucho:v1").is_wildcard());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Reordering filter insertion never changes the derived key.
        #[test]
        fn prop_key_independent_of_insertion_order(
            pairs in prop::collection::vec(("[a-z]{1,6}", "[a-zA-Z0-9]{1,6}"), 0..8)
        ) {
            let mut forward = FilterSet::new();
            for (name, value) in &pairs {
                forward.insert(name.clone(), [value.clone()]);
            }
            let mut backward = FilterSet::new();
            for (name, value) in pairs.iter().rev() {
                backward.insert(name.clone(), [value.clone()]);
            }
            let a = CacheKey::derive("corpus", &forward, 3);
            let b = CacheKey::derive("corpus", &backward, 3);
            prop_assert_eq!(a, b);
        }
    }
}
