//! Tracked payload
//!
//! The application-defined value a node propagates to its peers: a map from
//! string keys to arbitrary serializable values. It is replaced wholesale on
//! every `track` call and shared as an immutable snapshot afterwards.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// String-keyed map of JSON values
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackedPayload(Map<String, Value>);

impl TrackedPayload {
    pub fn new() -> Self {
        TrackedPayload(Map::new())
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for TrackedPayload {
    fn from(map: Map<String, Value>) -> Self {
        TrackedPayload(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for TrackedPayload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        TrackedPayload(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_builder() {
        let payload = TrackedPayload::new().with("x", 1).with("name", "alpha");

        assert_eq!(payload.len(), 2);
        assert_eq!(payload.get("x"), Some(&json!(1)));
        assert_eq!(payload.get("name"), Some(&json!("alpha")));
        assert!(payload.get("missing").is_none());
    }

    #[test]
    fn test_payload_serializes_as_plain_object() {
        let payload: TrackedPayload = [("x", json!(2))].into_iter().collect();
        let text = serde_json::to_string(&payload).unwrap();
        assert_eq!(text, r#"{"x":2}"#);
    }

    #[test]
    fn test_insert_replaces_value() {
        let mut payload = TrackedPayload::new();
        assert!(payload.insert("k", 1).is_none());
        assert_eq!(payload.insert("k", 2), Some(json!(1)));
        assert_eq!(payload.get("k"), Some(&json!(2)));
    }
}
