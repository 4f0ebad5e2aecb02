//! Key-value store capability trait and scan request types.

use std::future::Future;

use serde_json::Value;

use crate::error::SyncResult;
use crate::store::expression::UpdateExpression;
use crate::types::Record;

/// Opaque continuation token for a segment scan.
pub type ScanCursor = String;

/// Server-side predicate pushed down to each segment scan so unchanged items
/// are never transferred.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanFilter {
    /// Matches items whose `field` compares strictly greater than `value`.
    ///
    /// Strings compare lexicographically, which is ordering-correct for
    /// RFC 3339 timestamps; numbers compare numerically. Items missing the
    /// field never match.
    FieldGt { field: String, value: Value },
}

impl ScanFilter {
    /// Builds the "modification marker is newer than the watermark" filter.
    pub fn field_gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        ScanFilter::FieldGt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Evaluates the filter against one item.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            ScanFilter::FieldGt { field, value } => match (record.get(field), value) {
                (Some(Value::String(have)), Value::String(want)) => have.as_str() > want.as_str(),
                (Some(Value::Number(have)), Value::Number(want)) => {
                    match (have.as_f64(), want.as_f64()) {
                        (Some(have), Some(want)) => have > want,
                        _ => false,
                    }
                }
                _ => false,
            },
        }
    }
}

/// One page of results from a segment scan.
#[derive(Debug, Default)]
pub struct ScanPage {
    pub items: Vec<Record>,
    /// Cursor for the next page, or `None` when the segment is exhausted.
    pub next_cursor: Option<ScanCursor>,
}

/// Parameters for one segment scan call.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Zero-based index of the segment to read.
    pub segment: usize,
    /// Total number of segments the collection is partitioned into.
    pub total_segments: usize,
    pub filter: Option<ScanFilter>,
    pub cursor: Option<ScanCursor>,
}

/// Response of a batch read; `unprocessed_keys` must be re-requested until
/// empty.
#[derive(Debug, Default)]
pub struct BatchGetResponse {
    pub items: Vec<Record>,
    pub unprocessed_keys: Vec<String>,
}

/// Capability trait for the key-value store backing entities, sources and
/// watermarks.
///
/// Implementations signal throttling through
/// [`crate::error::ErrorKind::StoreThrottled`] so callers can retry with
/// backoff; all other errors are treated as fatal for the current operation.
pub trait KeyValueStore {
    /// Reads a single item by partition key, or `None` when absent.
    fn get_item(
        &self,
        table: &str,
        key: &str,
    ) -> impl Future<Output = SyncResult<Option<Record>>> + Send;

    /// Writes a full item, replacing any existing one with the same key.
    fn put_item(&self, table: &str, item: Record) -> impl Future<Output = SyncResult<()>> + Send;

    /// Reads up to a store-defined number of items by key in one round trip.
    fn batch_get(
        &self,
        table: &str,
        keys: &[String],
    ) -> impl Future<Output = SyncResult<BatchGetResponse>> + Send;

    /// Applies a partial update to one item. Fields not named by the
    /// expression keep their current values; the partition key is never
    /// touched.
    fn update_item(
        &self,
        table: &str,
        key: &str,
        update: UpdateExpression,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Reads one page of one segment of a collection scan.
    fn scan(
        &self,
        table: &str,
        request: ScanRequest,
    ) -> impl Future<Output = SyncResult<ScanPage>> + Send;
}

/// Fetches all requested keys, re-requesting unprocessed keys until the store
/// has returned every item it holds.
pub async fn batch_get_all<K>(store: &K, table: &str, keys: &[String]) -> SyncResult<Vec<Record>>
where
    K: KeyValueStore,
{
    let mut items = Vec::new();
    let mut pending: Vec<String> = keys.to_vec();

    while !pending.is_empty() {
        let response = store.batch_get(table, &pending).await?;
        items.extend(response.items);
        pending = response.unprocessed_keys;
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_gt_compares_timestamps_lexicographically() {
        let filter = ScanFilter::field_gt("uploaded_date", "2024-01-01T00:00:00+00:00");

        let mut newer = Record::new();
        newer.insert("uploaded_date".into(), json!("2024-06-01T00:00:00+00:00"));
        assert!(filter.matches(&newer));

        let mut older = Record::new();
        older.insert("uploaded_date".into(), json!("2023-12-31T00:00:00+00:00"));
        assert!(!filter.matches(&older));
    }

    #[test]
    fn field_gt_never_matches_missing_field() {
        let filter = ScanFilter::field_gt("uploaded_date", "2024-01-01T00:00:00+00:00");
        assert!(!filter.matches(&Record::new()));
    }

    #[test]
    fn field_gt_compares_numbers_numerically() {
        let filter = ScanFilter::field_gt("revision", json!(9));

        let mut record = Record::new();
        record.insert("revision".into(), json!(10));
        assert!(filter.matches(&record));

        record.insert("revision".into(), json!(9));
        assert!(!filter.matches(&record));
    }
}
