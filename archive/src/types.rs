//! Archive document types and metadata normalization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata is a flat string-keyed map of scalars once cleaned.
pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub distance: Option<f64>,
}

impl SearchHit {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
}

/// One page of a collection scan.
#[derive(Debug, Clone, Default)]
pub struct DocumentPage {
    pub documents: Vec<StoredDocument>,
}

/// Relevance score for a search hit: `1 - distance/2`, clipped to [0, 1].
pub fn relevance(distance: f64) -> f64 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

/// Normalize metadata values to what the vector store accepts: scalars
/// pass through, arrays serialize to JSON strings, null becomes the empty
/// string, everything else is stringified.
pub fn clean_metadata(raw: Metadata) -> Metadata {
    raw.into_iter()
        .map(|(key, value)| {
            let cleaned = match value {
                Value::String(_) | Value::Number(_) | Value::Bool(_) => value,
                Value::Array(items) => {
                    Value::String(serde_json::to_string(&items).unwrap_or_default())
                }
                Value::Null => Value::String(String::new()),
                other => Value::String(other.to_string()),
            };
            (key, cleaned)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relevance_clips_to_unit_interval() {
        assert_eq!(relevance(0.0), 1.0);
        assert_eq!(relevance(1.0), 0.5);
        assert_eq!(relevance(2.0), 0.0);
        assert_eq!(relevance(3.0), 0.0);
    }

    #[test]
    fn metadata_cleaning_contract() {
        let raw: Metadata = [
            ("s".to_string(), json!("text")),
            ("n".to_string(), json!(42)),
            ("b".to_string(), json!(true)),
            ("arr".to_string(), json!(["a", "b"])),
            ("null".to_string(), Value::Null),
            ("obj".to_string(), json!({"k": 1})),
        ]
        .into_iter()
        .collect();

        let cleaned = clean_metadata(raw);
        assert_eq!(cleaned["s"], json!("text"));
        assert_eq!(cleaned["n"], json!(42));
        assert_eq!(cleaned["b"], json!(true));
        assert_eq!(cleaned["arr"], json!("[\"a\",\"b\"]"));
        assert_eq!(cleaned["null"], json!(""));
        assert_eq!(cleaned["obj"], json!("{\"k\":1}"));
    }
}
