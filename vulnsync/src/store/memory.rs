//! In-memory key-value and blob store.
//!
//! Implements the full store contract against process memory: real segment
//! partitioning, pagination, server-side filter pushdown and batch reads. Used
//! by the integration tests and by local development runs where persistence is
//! not required. Fault injection hooks allow tests to exercise throttling,
//! unreachable tables and per-key update failures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{ErrorKind, SyncResult};
use crate::store::blob::BlobStore;
use crate::store::expression::UpdateExpression;
use crate::store::kv::{BatchGetResponse, KeyValueStore, ScanPage, ScanRequest};
use crate::sync_error;
use crate::types::Record;

const BATCH_GET_LIMIT: usize = 100;

/// One logical table: a key attribute name plus items ordered by key.
#[derive(Debug)]
struct TableData {
    key_attr: String,
    items: BTreeMap<String, Record>,
}

/// A single write applied to the store, kept for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { table: String, key: String },
    Update { table: String, key: String },
    PutObject { path: String },
}

/// Inner state of [`MemoryStore`].
#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, TableData>,
    blobs: HashMap<String, Vec<u8>>,
    /// Number of upcoming store calls that fail with a throttling error.
    throttles_remaining: u32,
    /// Tables whose operations fail as unavailable.
    failed_tables: HashSet<String>,
    /// Entity keys whose updates fail, for record-level failure tests.
    failing_update_keys: HashSet<String>,
    /// Append-only log of every successful write.
    write_log: Vec<WriteOp>,
}

/// In-memory implementation of [`KeyValueStore`] and [`BlobStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    /// Scan page size; small values force pagination in tests.
    page_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            page_size: 100,
        }
    }

    /// Creates a store whose scans return at most `page_size` items per page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            page_size: page_size.max(1),
        }
    }

    /// Registers a table and the name of its partition key attribute.
    pub async fn create_table(&self, table: &str, key_attr: &str) {
        let mut inner = self.inner.lock().await;
        inner.tables.insert(
            table.to_string(),
            TableData {
                key_attr: key_attr.to_string(),
                items: BTreeMap::new(),
            },
        );
    }

    /// Makes the next `count` store calls fail with a throttling error.
    pub async fn throttle_next(&self, count: u32) {
        self.inner.lock().await.throttles_remaining = count;
    }

    /// Makes every operation on `table` fail as unavailable.
    pub async fn fail_table(&self, table: &str) {
        self.inner.lock().await.failed_tables.insert(table.to_string());
    }

    /// Restores a previously failed table.
    pub async fn restore_table(&self, table: &str) {
        self.inner.lock().await.failed_tables.remove(table);
    }

    /// Makes `update_item` fail for a specific key, regardless of table.
    pub async fn fail_updates_for_key(&self, key: &str) {
        self.inner
            .lock()
            .await
            .failing_update_keys
            .insert(key.to_string());
    }

    /// Returns all writes performed since construction.
    pub async fn write_log(&self) -> Vec<WriteOp> {
        self.inner.lock().await.write_log.clone()
    }

    /// Returns the number of writes performed since construction.
    pub async fn write_count(&self) -> usize {
        self.inner.lock().await.write_log.len()
    }

    /// Returns a full copy of one item, for test assertions.
    pub async fn item(&self, table: &str, key: &str) -> Option<Record> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .and_then(|data| data.items.get(key).cloned())
    }

    /// Returns the number of items in a table.
    pub async fn table_len(&self, table: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|data| data.items.len())
            .unwrap_or(0)
    }
}

/// Stable mapping from an item key to its scan segment.
fn segment_of(key: &str, total_segments: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % total_segments as u64) as usize
}

impl Inner {
    fn check_faults(&mut self, table: &str) -> SyncResult<()> {
        if self.throttles_remaining > 0 {
            self.throttles_remaining -= 1;
            return Err(sync_error!(
                ErrorKind::StoreThrottled,
                "Request rate exceeded provisioned throughput",
                table
            ));
        }
        if self.failed_tables.contains(table) {
            return Err(sync_error!(
                ErrorKind::StoreUnavailable,
                "Table is unreachable",
                table
            ));
        }
        Ok(())
    }

    /// Blob fault check: a failed "table" entry matches any object path it
    /// prefixes, so tests can take a whole baseline prefix offline.
    fn check_blob_faults(&mut self, path: &str) -> SyncResult<()> {
        if self.throttles_remaining > 0 {
            self.throttles_remaining -= 1;
            return Err(sync_error!(
                ErrorKind::StoreThrottled,
                "Request rate exceeded provisioned throughput",
                path
            ));
        }
        if self
            .failed_tables
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return Err(sync_error!(
                ErrorKind::BlobStoreUnavailable,
                "Blob store is unreachable",
                path
            ));
        }
        Ok(())
    }

    fn table(&self, table: &str) -> SyncResult<&TableData> {
        self.tables.get(table).ok_or_else(|| {
            sync_error!(ErrorKind::StoreQueryFailed, "Unknown table", table)
        })
    }

    fn table_mut(&mut self, table: &str) -> SyncResult<&mut TableData> {
        self.tables.get_mut(table).ok_or_else(|| {
            sync_error!(ErrorKind::StoreQueryFailed, "Unknown table", table)
        })
    }
}

impl KeyValueStore for MemoryStore {
    async fn get_item(&self, table: &str, key: &str) -> SyncResult<Option<Record>> {
        let mut inner = self.inner.lock().await;
        inner.check_faults(table)?;

        Ok(inner.table(table)?.items.get(key).cloned())
    }

    async fn put_item(&self, table: &str, item: Record) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_faults(table)?;

        let data = inner.table_mut(table)?;
        let key_attr = data.key_attr.clone();
        let Some(key) = item.get(&key_attr).and_then(Value::as_str).map(String::from) else {
            return Err(sync_error!(
                ErrorKind::InvalidData,
                "Item is missing its partition key attribute",
                key_attr
            ));
        };

        data.items.insert(key.clone(), item);
        inner.write_log.push(WriteOp::Put {
            table: table.to_string(),
            key,
        });

        Ok(())
    }

    async fn batch_get(&self, table: &str, keys: &[String]) -> SyncResult<BatchGetResponse> {
        let mut inner = self.inner.lock().await;
        inner.check_faults(table)?;

        let data = inner.table(table)?;
        let (served, unprocessed) = if keys.len() > BATCH_GET_LIMIT {
            keys.split_at(BATCH_GET_LIMIT)
        } else {
            (keys, &[][..])
        };

        let items = served
            .iter()
            .filter_map(|key| data.items.get(key).cloned())
            .collect();

        Ok(BatchGetResponse {
            items,
            unprocessed_keys: unprocessed.to_vec(),
        })
    }

    async fn update_item(
        &self,
        table: &str,
        key: &str,
        update: UpdateExpression,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_faults(table)?;

        if inner.failing_update_keys.contains(key) {
            return Err(sync_error!(
                ErrorKind::StoreQueryFailed,
                "Injected update failure",
                key
            ));
        }

        let data = inner.table_mut(table)?;
        let key_attr = data.key_attr.clone();

        // Upsert semantics: a missing item is created with its key attribute,
        // matching the remote store's update behavior. Left-join containment
        // is enforced by the join executor, not here.
        let item = data.items.entry(key.to_string()).or_insert_with(|| {
            let mut item = Record::new();
            item.insert(key_attr.clone(), Value::String(key.to_string()));
            item
        });

        for (field, value) in update.assignments() {
            if field == key_attr {
                continue;
            }
            item.insert(field.to_string(), value.clone());
        }

        inner.write_log.push(WriteOp::Update {
            table: table.to_string(),
            key: key.to_string(),
        });

        Ok(())
    }

    async fn scan(&self, table: &str, request: ScanRequest) -> SyncResult<ScanPage> {
        let mut inner = self.inner.lock().await;
        inner.check_faults(table)?;

        if request.total_segments == 0 || request.segment >= request.total_segments {
            return Err(sync_error!(
                ErrorKind::StoreQueryFailed,
                "Invalid scan segment",
                format!("segment {} of {}", request.segment, request.total_segments)
            ));
        }

        let data = inner.table(table)?;

        // Keys in this segment, in stable order, with the filter applied
        // before pagination. The cursor is the last key served.
        let matching = data.items.iter().filter(|(key, record)| {
            segment_of(key, request.total_segments) == request.segment
                && request
                    .filter
                    .as_ref()
                    .map(|filter| filter.matches(record))
                    .unwrap_or(true)
        });

        let mut after_cursor: Vec<(&String, &Record)> = match &request.cursor {
            Some(cursor) => matching.skip_while(|(key, _)| *key <= cursor).collect(),
            None => matching.collect(),
        };

        let has_more = after_cursor.len() > self.page_size;
        after_cursor.truncate(self.page_size);

        let next_cursor = if has_more {
            after_cursor.last().map(|(key, _)| (*key).clone())
        } else {
            None
        };

        Ok(ScanPage {
            items: after_cursor
                .into_iter()
                .map(|(_, record)| record.clone())
                .collect(),
            next_cursor,
        })
    }
}

impl BlobStore for MemoryStore {
    async fn get_object(&self, path: &str) -> SyncResult<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        inner.check_blob_faults(path)?;

        Ok(inner.blobs.get(path).cloned())
    }

    async fn put_object(&self, path: &str, bytes: Vec<u8>) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_blob_faults(path)?;

        inner.blobs.insert(path.to_string(), bytes);
        inner.write_log.push(WriteOp::PutObject {
            path: path.to_string(),
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::{ScanFilter, batch_get_all};
    use serde_json::json;

    fn item(key: &str, extra: &[(&str, Value)]) -> Record {
        let mut record = Record::new();
        record.insert("cve_id".into(), json!(key));
        for (field, value) in extra {
            record.insert((*field).to_string(), value.clone());
        }
        record
    }

    async fn seeded_store(page_size: usize, count: usize) -> MemoryStore {
        let store = MemoryStore::with_page_size(page_size);
        store.create_table("vulns", "cve_id").await;
        for i in 0..count {
            store
                .put_item("vulns", item(&format!("CVE-2024-{i:04}"), &[]))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn segments_partition_the_table_completely() {
        let store = seeded_store(1000, 50).await;

        let mut total = 0;
        for segment in 0..4 {
            let page = store
                .scan(
                    "vulns",
                    ScanRequest {
                        segment,
                        total_segments: 4,
                        filter: None,
                        cursor: None,
                    },
                )
                .await
                .unwrap();
            assert!(page.next_cursor.is_none());
            total += page.items.len();
        }

        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn pagination_returns_every_item_exactly_once() {
        let store = seeded_store(7, 20).await;

        let mut seen = HashSet::new();
        let mut cursor = None;
        loop {
            let page = store
                .scan(
                    "vulns",
                    ScanRequest {
                        segment: 0,
                        total_segments: 1,
                        filter: None,
                        cursor,
                    },
                )
                .await
                .unwrap();
            for record in &page.items {
                assert!(seen.insert(record["cve_id"].as_str().unwrap().to_string()));
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn filter_is_applied_server_side() {
        let store = MemoryStore::new();
        store.create_table("vulns", "cve_id").await;
        store
            .put_item(
                "vulns",
                item("CVE-2024-0001", &[("uploaded_date", json!("2024-05-01"))]),
            )
            .await
            .unwrap();
        store
            .put_item(
                "vulns",
                item("CVE-2024-0002", &[("uploaded_date", json!("2023-01-01"))]),
            )
            .await
            .unwrap();

        let page = store
            .scan(
                "vulns",
                ScanRequest {
                    segment: 0,
                    total_segments: 1,
                    filter: Some(ScanFilter::field_gt("uploaded_date", "2024-01-01")),
                    cursor: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0]["cve_id"], json!("CVE-2024-0001"));
    }

    #[tokio::test]
    async fn batch_get_loops_until_unprocessed_keys_drain() {
        let store = seeded_store(1000, 250).await;
        let keys: Vec<String> = (0..250).map(|i| format!("CVE-2024-{i:04}")).collect();

        let items = batch_get_all(&store, "vulns", &keys).await.unwrap();
        assert_eq!(items.len(), 250);
    }

    #[tokio::test]
    async fn throttle_injection_fails_then_recovers() {
        let store = seeded_store(1000, 1).await;
        store.throttle_next(1).await;

        let err = store.get_item("vulns", "CVE-2024-0000").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreThrottled);

        assert!(
            store
                .get_item("vulns", "CVE-2024-0000")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn update_item_merges_without_touching_other_fields() {
        let store = MemoryStore::new();
        store.create_table("vulns", "cve_id").await;
        store
            .put_item(
                "vulns",
                item("CVE-2024-0001", &[("nvd_severity", json!("HIGH"))]),
            )
            .await
            .unwrap();

        let mut fields = Record::new();
        fields.insert("epss_value".into(), json!(0.5));
        let update = UpdateExpression::builder("cve_id").set_fields(fields).build();
        store.update_item("vulns", "CVE-2024-0001", update).await.unwrap();

        let merged = store.item("vulns", "CVE-2024-0001").await.unwrap();
        assert_eq!(merged["nvd_severity"], json!("HIGH"));
        assert_eq!(merged["epss_value"], json!(0.5));
        assert_eq!(merged["cve_id"], json!("CVE-2024-0001"));
    }
}
