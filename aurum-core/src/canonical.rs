use serde_json::Value;

/// Produce the deterministic JSON string fed to all consensus hashes.
///
/// `serde_json::Value` objects are backed by a `BTreeMap`, so keys are
/// always emitted in sorted order, and `to_string` uses compact `,`/`:`
/// separators. Every consensus preimage built here is ASCII by
/// construction (hex digests, prefixed addresses, decimal numbers), so no
/// further escaping is needed. Two nodes serializing the same logical
/// content therefore produce byte-identical strings.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_compact() {
        let v = json!({"zebra": 1, "alpha": 2, "mid": {"b": 1, "a": 2}});
        assert_eq!(canonical_json(&v), r#"{"alpha":2,"mid":{"a":2,"b":1},"zebra":1}"#);
    }

    #[test]
    fn identical_content_hashes_identically() {
        let a = json!({"amount": 1.5, "fee": 0.01});
        let b = json!({"fee": 0.01, "amount": 1.5});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }
}
