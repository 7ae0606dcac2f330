//! Upstream corpus record parsing.
//!
//! The upstream body is either `{"units": [...]}` or a bare array of
//! records. Each record is an object with `text` (or `content`) and an
//! optional `id`; every other field is kept as unit metadata.

use corpus_core::{Corpus, FetchError, TextUnit};
use serde_json::Value;

pub fn parse_corpus(corpus_type: &str, body: &str) -> Result<Corpus, FetchError> {
    let document: Value = serde_json::from_str(body).map_err(|e| parse_error(e.to_string()))?;

    let records = match document {
        Value::Array(records) => records,
        Value::Object(mut object) => match object.remove("units") {
            Some(Value::Array(records)) => records,
            Some(other) => {
                return Err(parse_error(format!(
                    "\"units\" must be an array, got {}",
                    kind(&other)
                )))
            }
            None => return Err(parse_error("missing \"units\" array".to_string())),
        },
        other => {
            return Err(parse_error(format!(
                "expected an object or array, got {}",
                kind(&other)
            )))
        }
    };

    let units = records
        .into_iter()
        .enumerate()
        .map(|(index, record)| parse_unit(index, record))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Corpus::new(corpus_type, units))
}

fn parse_unit(index: usize, record: Value) -> Result<TextUnit, FetchError> {
    let mut fields = match record {
        Value::Object(fields) => fields,
        other => {
            return Err(parse_error(format!(
                "record {index} is {}, not an object",
                kind(&other)
            )))
        }
    };

    let text = match fields.remove("text").or_else(|| fields.remove("content")) {
        Some(Value::String(text)) => text,
        Some(other) => {
            return Err(parse_error(format!(
                "record {index} text is {}, not a string",
                kind(&other)
            )))
        }
        None => return Err(parse_error(format!("record {index} has no text"))),
    };

    let id = match fields.remove("id") {
        Some(Value::String(id)) => id,
        Some(Value::Number(id)) => id.to_string(),
        Some(Value::Null) | None => index.to_string(),
        Some(other) => {
            return Err(parse_error(format!(
                "record {index} id is {}, not a string or number",
                kind(&other)
            )))
        }
    };

    Ok(TextUnit {
        id,
        text,
        metadata: fields.into_iter().collect(),
    })
}

fn parse_error(reason: String) -> FetchError {
    FetchError::Parse { reason }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_units_object() {
        let body = json!({
            "units": [
                {"id": "mf-1", "text": "Aquí me pongo a cantar", "author": "Hernández", "year": 1872},
                {"id": 7, "content": "al compás de la vigüela"}
            ]
        })
        .to_string();

        let corpus = parse_corpus("gaucho", &body).expect("parse");
        assert_eq!(corpus.corpus_type, "gaucho");
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.units[0].id, "mf-1");
        assert_eq!(corpus.units[0].metadata.get("year"), Some(&json!(1872)));
        assert_eq!(corpus.units[1].id, "7");
        assert_eq!(corpus.units[1].text, "al compás de la vigüela");
        assert!(corpus.units[1].metadata.is_empty());
    }

    #[test]
    fn test_bare_array_assigns_positional_ids() {
        let body = json!([{"text": "uno"}, {"text": "dos", "id": null}]).to_string();
        let corpus = parse_corpus("tango", &body).expect("parse");
        let ids: Vec<&str> = corpus.units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1"]);
    }

    #[test]
    fn test_empty_corpus() {
        let corpus = parse_corpus("tango", r#"{"units": []}"#).expect("parse");
        assert!(corpus.is_empty());
    }

    #[test]
    fn test_rejects_malformed_bodies() {
        for body in [
            "not json",
            "42",
            r#"{"items": []}"#,
            r#"{"units": {}}"#,
            r#"["bare string"]"#,
            r#"[{"id": "x"}]"#,
            r#"[{"text": 3}]"#,
            r#"[{"text": "ok", "id": [1]}]"#,
        ] {
            let err = parse_corpus("gaucho", body);
            assert!(
                matches!(err, Err(FetchError::Parse { .. })),
                "expected parse error for {body}"
            );
        }
    }
}
