//! Schemaless record and field types shared across the synchronizer.

use serde_json::Value;

/// A schemaless item as read from or written to the key-value store.
///
/// `serde_json::Map` is backed by a BTree map, so serializing a [`Record`]
/// always emits fields in key order. Canonical baseline hashing relies on this.
pub type Record = serde_json::Map<String, Value>;

/// A set of output fields produced by a source transform, keyed by the final
/// (source-prefixed) attribute name.
pub type FieldMap = serde_json::Map<String, Value>;

/// Returns the string value of a field, if present and textual.
pub fn get_str<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

/// Returns whether a value is a null or empty placeholder that must never be
/// written over an existing attribute.
///
/// Mirrors the store adapter's cleaning rules: `null`, empty strings, the
/// literal string "null", and empty collections all count as absent.
pub fn is_placeholder(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null")
        }
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholder_detection() {
        assert!(is_placeholder(&Value::Null));
        assert!(is_placeholder(&json!("")));
        assert!(is_placeholder(&json!("  ")));
        assert!(is_placeholder(&json!("null")));
        assert!(is_placeholder(&json!([])));
        assert!(is_placeholder(&json!({})));

        assert!(!is_placeholder(&json!(0)));
        assert!(!is_placeholder(&json!(false)));
        assert!(!is_placeholder(&json!("value")));
    }
}
