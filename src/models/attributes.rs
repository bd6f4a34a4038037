//! Open key→scalar maps.
//!
//! The workflow engine decides the shape of schedule `params` and execution
//! `metrics`, so they are kept as flat maps instead of fixed structs. Values must
//! be scalars; nested objects or arrays are rejected at deserialization time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single scalar value inside an [`Attributes`] map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Flat map of attribute name to scalar value.
pub type Attributes = BTreeMap<String, Scalar>;

/// Merge `incoming` into `target`. Keys present in both take the incoming value.
pub fn merge(target: &mut Attributes, incoming: &Attributes) {
    for (key, value) in incoming {
        target.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_flat_scalar_maps() {
        let attrs: Attributes = serde_json::from_value(json!({
            "found": 12,
            "ratio": 0.5,
            "source": "portal",
            "partial": false,
            "cursor": null
        }))
        .unwrap();

        assert_eq!(attrs["found"], Scalar::Int(12));
        assert_eq!(attrs["ratio"], Scalar::Float(0.5));
        assert_eq!(attrs["source"], Scalar::Text("portal".into()));
        assert_eq!(attrs["partial"], Scalar::Bool(false));
        assert_eq!(attrs["cursor"], Scalar::Null);
    }

    #[test]
    fn rejects_nested_values() {
        let parsed = serde_json::from_value::<Attributes>(json!({ "nested": { "a": 1 } }));
        assert!(parsed.is_err());

        let parsed = serde_json::from_value::<Attributes>(json!({ "list": [1, 2] }));
        assert!(parsed.is_err());
    }

    #[test]
    fn merge_is_a_union_with_incoming_precedence() {
        let mut target: Attributes = serde_json::from_value(json!({ "a": 1, "b": 2 })).unwrap();
        let incoming: Attributes = serde_json::from_value(json!({ "b": 3, "c": "x" })).unwrap();

        merge(&mut target, &incoming);

        assert_eq!(target.len(), 3);
        assert_eq!(target["a"], Scalar::Int(1));
        assert_eq!(target["b"], Scalar::Int(3));
        assert_eq!(target["c"], Scalar::Text("x".into()));
    }
}
