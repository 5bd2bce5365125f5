//! Canonical stream-key derivation for the HTTP sink.
//!
//! The key must depend only on the (key, value) multiset of a label map,
//! never on iteration order, so two records built from differently
//! ordered maps land in the same stream.

use std::collections::{BTreeMap, HashMap};

/// Canonical JSON object of `labels` with keys sorted lexicographically.
/// `BTreeMap` does the sorting; `serde_json` never reorders object keys
/// once it has them, so this is stable across repeated calls on the same
/// input and across any permutation of the source map's iteration order.
pub fn stream_key_of(labels: &HashMap<String, String>) -> String {
    let sorted: BTreeMap<&String, &String> = labels.iter().collect();
    serde_json::to_string(&sorted).expect("string-keyed map always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_order_independent() {
        let mut a = HashMap::new();
        a.insert("app".to_string(), "x".to_string());
        a.insert("env".to_string(), "prod".to_string());
        a.insert("svc".to_string(), "api".to_string());

        let mut b = HashMap::new();
        b.insert("svc".to_string(), "api".to_string());
        b.insert("app".to_string(), "x".to_string());
        b.insert("env".to_string(), "prod".to_string());

        assert_eq!(stream_key_of(&a), stream_key_of(&b));
    }

    #[test]
    fn key_is_deterministic_over_many_calls() {
        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "x".to_string());
        labels.insert("env".to_string(), "prod".to_string());
        labels.insert("svc".to_string(), "api".to_string());
        labels.insert("region".to_string(), "us-east-1".to_string());
        labels.insert("pod".to_string(), "abc123".to_string());

        let first = stream_key_of(&labels);
        for _ in 0..1000 {
            assert_eq!(stream_key_of(&labels), first);
        }
    }
}
