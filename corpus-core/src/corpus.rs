//! The decompressed corpus handed to callers.
//!
//! The cache itself never looks inside a [`Corpus`]; it only stores its
//! serialized JSON form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single text unit (a poem, a song, a document) with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextUnit {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl TextUnit {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(name.into(), value);
        self
    }
}

/// A collection of text units of one corpus type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Corpus {
    pub corpus_type: String,
    pub units: Vec<TextUnit>,
}

impl Corpus {
    pub fn new(corpus_type: impl Into<String>, units: Vec<TextUnit>) -> Self {
        Self {
            corpus_type: corpus_type.into(),
            units,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_corpus_json_round_trip() {
        let corpus = Corpus::new(
            "gaucho",
            vec![
                TextUnit::new("1", "Aquí me pongo a cantar").with_metadata("year", json!(1872)),
                TextUnit::new("2", "al compás de la vigüela"),
            ],
        );
        let json = serde_json::to_string(&corpus).expect("serialize");
        let back: Corpus = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, corpus);
        assert_eq!(back.len(), 2);
        assert!(json.contains("corpusType"));
    }
}
