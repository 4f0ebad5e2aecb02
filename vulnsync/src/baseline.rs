//! Baseline snapshots for sources without a modification marker.
//!
//! A static source cannot be scanned incrementally by the store, so the engine
//! keeps its own memory of what the source looked like after the last pass: a
//! blob-store object mapping each normalized key to the full record and a
//! content hash. Diffing against the baseline instead of rewriting every
//! record each run saves write capacity and keeps change volume honest in the
//! logs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{ErrorKind, SyncResult};
use crate::store::blob::BlobStore;
use crate::sync_error;
use crate::types::Record;

/// One remembered record of a static source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaselineEntry {
    pub record: Record,
    pub content_hash: String,
}

/// Last-known state of a static source, keyed by normalized join key.
pub type BaselineMap = BTreeMap<String, BaselineEntry>;

/// Loads and persists per-source baselines in the blob store.
#[derive(Debug, Clone)]
pub struct BaselineManager<B> {
    store: B,
    prefix: String,
}

impl<B> BaselineManager<B>
where
    B: BlobStore,
{
    pub fn new(store: B, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }

        Self { store, prefix }
    }

    fn object_path(&self, source: &str) -> String {
        format!("{}/{}/baseline.json", self.prefix, source)
    }

    /// Fetches the last persisted baseline for `source`.
    ///
    /// A missing object means this is the source's first pass and yields an
    /// empty map, not an error.
    pub async fn load(&self, source: &str) -> SyncResult<BaselineMap> {
        let path = self.object_path(source);

        let Some(bytes) = self.store.get_object(&path).await? else {
            debug!(source, "no baseline found, starting from empty");
            return Ok(BaselineMap::new());
        };

        let baseline: BaselineMap = serde_json::from_slice(&bytes)?;
        debug!(source, entries = baseline.len(), "loaded baseline");

        Ok(baseline)
    }

    /// Persists the full merged baseline for `source`, replacing the previous
    /// object. Callers pass the merged map (old entries plus this pass's), so
    /// the baseline never shrinks.
    pub async fn save(&self, source: &str, baseline: &BaselineMap) -> SyncResult<()> {
        let path = self.object_path(source);
        let bytes = serde_json::to_vec(baseline).map_err(|err| {
            sync_error!(
                ErrorKind::SerializationError,
                "Failed to serialize baseline",
                err.to_string(),
                source: err
            )
        })?;

        self.store.put_object(&path, bytes).await?;
        debug!(source, entries = baseline.len(), "saved baseline");

        Ok(())
    }
}

/// Computes the content hash of a record over its canonical form.
///
/// Volatile fields (anything known to change trivially every upload, like an
/// upload timestamp) are stripped at every nesting level, string values are
/// whitespace-trimmed, and objects serialize key-sorted with compact
/// separators, so semantically identical records hash identically regardless
/// of field order.
pub fn content_hash(record: &Record, volatile_fields: &[String]) -> SyncResult<String> {
    let canonical = canonicalize(&Value::Object(record.clone()), volatile_fields);
    let bytes = serde_json::to_vec(&canonical).map_err(|err| {
        sync_error!(
            ErrorKind::SerializationError,
            "Failed to serialize record for hashing",
            err.to_string(),
            source: err
        )
    })?;

    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn canonicalize(value: &Value, volatile_fields: &[String]) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(key, _)| !volatile_fields.iter().any(|volatile| volatile == *key))
                .map(|(key, value)| (key.clone(), canonicalize(value, volatile_fields)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| canonicalize(item, volatile_fields))
                .collect(),
        ),
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        let mut record = Record::new();
        for (field, value) in pairs {
            record.insert((*field).to_string(), value.clone());
        }
        record
    }

    #[test]
    fn hash_ignores_field_order() {
        let a = record(&[("cve", json!("CVE-2024-0001")), ("score", json!(9.8))]);
        let b = record(&[("score", json!(9.8)), ("cve", json!("CVE-2024-0001"))]);

        assert_eq!(
            content_hash(&a, &[]).unwrap(),
            content_hash(&b, &[]).unwrap()
        );
    }

    #[test]
    fn hash_ignores_volatile_fields_at_any_depth() {
        let volatile = vec!["uploaded_date".to_string()];

        let a = record(&[
            ("cve", json!("CVE-2024-0001")),
            ("uploaded_date", json!("2024-01-01")),
            ("nested", json!({"uploaded_date": "2024-01-01", "kept": 1})),
        ]);
        let b = record(&[
            ("cve", json!("CVE-2024-0001")),
            ("uploaded_date", json!("2025-12-31")),
            ("nested", json!({"uploaded_date": "2030-01-01", "kept": 1})),
        ]);

        assert_eq!(
            content_hash(&a, &volatile).unwrap(),
            content_hash(&b, &volatile).unwrap()
        );
    }

    #[test]
    fn hash_changes_when_an_included_field_changes() {
        let a = record(&[("cve", json!("CVE-2024-0001")), ("score", json!(9.8))]);
        let b = record(&[("cve", json!("CVE-2024-0001")), ("score", json!(5.0))]);

        assert_ne!(
            content_hash(&a, &[]).unwrap(),
            content_hash(&b, &[]).unwrap()
        );
    }

    #[test]
    fn hash_normalizes_whitespace_in_strings() {
        let a = record(&[("vendor", json!("  Acme Corp "))]);
        let b = record(&[("vendor", json!("Acme Corp"))]);

        assert_eq!(
            content_hash(&a, &[]).unwrap(),
            content_hash(&b, &[]).unwrap()
        );
    }

    #[tokio::test]
    async fn load_missing_baseline_is_empty_not_error() {
        let manager = BaselineManager::new(MemoryStore::new(), "vuln-raw-source/");

        let baseline = manager.load("ibm-merged-data").await.unwrap();
        assert!(baseline.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let manager = BaselineManager::new(MemoryStore::new(), "vuln-raw-source");

        let rec = record(&[("cve", json!("CVE-2024-0001"))]);
        let mut baseline = BaselineMap::new();
        baseline.insert(
            "CVE-2024-0001".to_string(),
            BaselineEntry {
                content_hash: content_hash(&rec, &[]).unwrap(),
                record: rec,
            },
        );

        manager.save("ibm-merged-data", &baseline).await.unwrap();
        let loaded = manager.load("ibm-merged-data").await.unwrap();

        assert_eq!(loaded, baseline);
    }
}
