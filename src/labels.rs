//! Label sets and their canonical byte encoding.
//!
//! Labels are structured key-value data (a JSON object). Stored entries
//! never keep the structured form; they keep a canonical byte encoding
//! with sorted keys and no duplicates, so equality between label sets is
//! a plain byte comparison. That matters in two places: the table compares
//! keys while holding a partition lock (no parsing allowed there), and
//! comparisons must not depend on any process-local state such as locale
//! or map iteration order.

use serde_json::{Map, Value};

use crate::error::{MetricsError, MetricsResult};

/// A structured label set.
///
/// Semantically a JSON object: string keys, arbitrary JSON values.
/// Two sets with the same pairs are equal regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet {
    map: Map<String, Value>,
}

impl LabelSet {
    /// Create an empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a label, replacing any existing value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.map.insert(key.into(), value.into());
        self
    }

    /// Build a label set from a JSON value.
    ///
    /// Accepts an object or `null` (treated as empty). Anything else is
    /// rejected: labels are key-value data, not scalars or arrays.
    pub fn from_value(value: Value) -> MetricsResult<Self> {
        match value {
            Value::Object(map) => Ok(Self { map }),
            Value::Null => Ok(Self::new()),
            _ => Err(MetricsError::InvalidLabels),
        }
    }

    /// Whether this set has no labels. Empty sets are interchangeable
    /// with absent labels everywhere in the store.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Look up a label value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    /// Encode to the canonical byte form.
    ///
    /// Keys serialize in sorted order (serde_json's map is ordered), so
    /// semantically identical sets produce byte-identical encodings. An
    /// empty set must be handled by the caller as absent; this method is
    /// only meaningful for non-empty sets.
    pub fn canonical_bytes(&self) -> MetricsResult<Vec<u8>> {
        serde_json::to_vec(&self.map).map_err(|_| MetricsError::InvalidLabels)
    }

    /// Decode from canonical bytes, restoring the structured form.
    pub fn from_canonical(bytes: &[u8]) -> MetricsResult<Self> {
        let map: Map<String, Value> =
            serde_json::from_slice(bytes).map_err(|_| MetricsError::InvalidLabels)?;
        Ok(Self { map })
    }

    /// View as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.map.clone())
    }
}

impl From<Map<String, Value>> for LabelSet {
    fn from(map: Map<String, Value>) -> Self {
        Self { map }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut a = LabelSet::new();
        a.insert("zone", "us-east").insert("app", "api");

        let mut b = LabelSet::new();
        b.insert("app", "api").insert("zone", "us-east");

        assert_eq!(a, b);
        assert_eq!(
            a.canonical_bytes().unwrap(),
            b.canonical_bytes().unwrap(),
            "canonical encodings must be byte-identical"
        );
    }

    #[test]
    fn test_distinct_sets_encode_differently() {
        let mut a = LabelSet::new();
        a.insert("app", "api");
        let mut b = LabelSet::new();
        b.insert("app", "worker");
        assert_ne!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    #[test]
    fn test_roundtrip_preserves_values() {
        let set = LabelSet::from_value(json!({
            "shard": 3,
            "primary": true,
            "host": "db-1"
        }))
        .unwrap();
        let bytes = set.canonical_bytes().unwrap();
        let decoded = LabelSet::from_canonical(&bytes).unwrap();
        assert_eq!(set, decoded);
        assert_eq!(decoded.get("shard"), Some(&json!(3)));
    }

    #[test]
    fn test_null_is_empty() {
        let set = LabelSet::from_value(Value::Null).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(LabelSet::from_value(json!([1, 2, 3])).is_err());
        assert!(LabelSet::from_value(json!("plain")).is_err());
        assert!(LabelSet::from_value(json!(42)).is_err());
    }

    #[test]
    fn test_duplicate_keys_collapse() {
        // A caller re-inserting a key keeps only the last value, so the
        // canonical form never carries duplicates.
        let mut set = LabelSet::new();
        set.insert("k", "v1").insert("k", "v2");
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("k"), Some(&json!("v2")));
    }
}
