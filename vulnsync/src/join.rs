//! Applies a source's changed records onto the unified entity table.
//!
//! The join is a left join with the entity table as the base: a changed source
//! record only ever enriches an entity that already exists, it never creates
//! one. Updates are partial, so concurrent sources writing disjoint field sets
//! compose instead of clobbering each other.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::detect::ChangedRecord;
use crate::error::{ErrorKind, SyncResult};
use crate::sync_error;
use crate::retry::RetryPolicy;
use crate::store::expression::UpdateExpression;
use crate::store::kv::{KeyValueStore, batch_get_all};
use crate::transform::SourceSpec;

/// Tally of one join batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinStats {
    /// Changed records handed to the executor.
    pub scanned: usize,
    /// Records whose join key exists in the entity table.
    pub matched: usize,
    /// Matched records whose update was written.
    pub updated: usize,
    /// Matched records whose transform contributed no fields.
    pub skipped: usize,
    /// Matched records whose update failed after exhausting retries.
    pub failed: usize,
}

/// Writes per-source field contributions into the entity table with bounded
/// parallelism. Record-level failures are tallied, never fatal; the batch
/// always runs to completion.
#[derive(Debug, Clone)]
pub struct JoinExecutor<K> {
    store: K,
    entity_table: String,
    key_attr: String,
    retry: RetryPolicy,
    max_parallel_updates: usize,
}

impl<K> JoinExecutor<K>
where
    K: KeyValueStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        store: K,
        entity_table: impl Into<String>,
        key_attr: impl Into<String>,
        retry: RetryPolicy,
        max_parallel_updates: usize,
    ) -> Self {
        Self {
            store,
            entity_table: entity_table.into(),
            key_attr: key_attr.into(),
            retry,
            max_parallel_updates: max_parallel_updates.max(1),
        }
    }

    /// Applies one source's changed records and returns the batch tally.
    pub async fn apply(
        &self,
        source: &SourceSpec,
        changes: Vec<ChangedRecord>,
    ) -> SyncResult<JoinStats> {
        let mut stats = JoinStats {
            scanned: changes.len(),
            ..JoinStats::default()
        };

        if changes.is_empty() {
            return Ok(stats);
        }

        let existing = self.existing_entity_keys(&changes).await?;

        let mut tasks: JoinSet<SyncResult<()>> = JoinSet::new();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel_updates));

        for change in changes {
            if !existing.contains(change.key.as_str()) {
                debug!(
                    source = %source.name,
                    key = %change.key,
                    "no base entity for key, skipping"
                );
                continue;
            }
            stats.matched += 1;

            let fields = source.transform.apply(&change.record);
            let mut builder = UpdateExpression::builder(&self.key_attr);
            // The modification marker drives change detection; it is never
            // part of the entity row.
            if let Some(marker) = source.marker_field() {
                builder = builder.exclude(marker);
            }
            let update = builder.set_fields(fields).build();
            if update.is_empty() {
                stats.skipped += 1;
                continue;
            }

            let store = self.store.clone();
            let table = self.entity_table.clone();
            let retry = self.retry.clone();
            let key = change.key.into_string();
            let permits = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(sync_error!(
                            ErrorKind::InvalidState,
                            "Update permit pool closed"
                        ));
                    }
                };
                retry
                    .retry("update_item", || {
                        store.update_item(&table, &key, update.clone())
                    })
                    .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => stats.updated += 1,
                Ok(Err(err)) => {
                    stats.failed += 1;
                    error!(source = %source.name, error = %err, "entity update failed");
                }
                Err(join_err) => {
                    stats.failed += 1;
                    let err = sync_error!(
                        ErrorKind::WorkerPanic,
                        "Update task panicked",
                        source: join_err
                    );
                    error!(source = %source.name, error = %err, "update task panicked");
                }
            }
        }

        info!(
            source = %source.name,
            scanned = stats.scanned,
            matched = stats.matched,
            updated = stats.updated,
            skipped = stats.skipped,
            failed = stats.failed,
            "join batch complete"
        );

        Ok(stats)
    }

    /// Which of the changed keys already exist in the entity table.
    async fn existing_entity_keys(
        &self,
        changes: &[ChangedRecord],
    ) -> SyncResult<HashSet<String>> {
        let keys: Vec<String> = changes
            .iter()
            .map(|change| change.key.as_str().to_string())
            .collect();

        let items = self
            .retry
            .retry("batch_get", || {
                batch_get_all(&self.store, &self.entity_table, &keys)
            })
            .await?;

        Ok(items
            .into_iter()
            .filter_map(|item| {
                item.get(&self.key_attr)
                    .and_then(|value| value.as_str())
                    .map(str::to_string)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::cve::normalize_cve;
    use crate::store::memory::MemoryStore;
    use crate::transform::{FieldRename, RenameTransform, SourceSpec};
    use crate::types::Record;

    fn executor(store: MemoryStore) -> JoinExecutor<MemoryStore> {
        let retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        JoinExecutor::new(store, "vulns", "cve_id", retry, 4)
    }

    fn kev_source() -> SourceSpec {
        SourceSpec::dynamic(
            "kev",
            "kev_table",
            "cveID",
            "uploaded_date",
            Arc::new(RenameTransform::new(vec![
                FieldRename::new("kev_date_added", &["dateAdded"]),
                FieldRename::new("kev_ransomware", &["knownRansomwareCampaignUse"]),
            ])),
        )
    }

    fn change(id: &str, pairs: &[(&str, serde_json::Value)]) -> ChangedRecord {
        let mut record = Record::new();
        for (field, value) in pairs {
            record.insert((*field).to_string(), value.clone());
        }
        ChangedRecord {
            key: normalize_cve(id).unwrap(),
            record,
        }
    }

    async fn seeded_base(ids: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        store.create_table("vulns", "cve_id").await;
        for id in ids {
            let mut item = Record::new();
            item.insert("cve_id".into(), json!(*id));
            item.insert("description".into(), json!("base"));
            store.put_item("vulns", item).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn updates_only_existing_entities() {
        let store = seeded_base(&["CVE-2024-0001"]).await;
        let stats = executor(store.clone())
            .apply(
                &kev_source(),
                vec![
                    change("CVE-2024-0001", &[("dateAdded", json!("2024-06-01"))]),
                    change("CVE-2024-9999", &[("dateAdded", json!("2024-06-02"))]),
                ],
            )
            .await
            .unwrap();

        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.updated, 1);
        assert!(store.item("vulns", "CVE-2024-9999").await.is_none());

        let item = store.item("vulns", "CVE-2024-0001").await.unwrap();
        assert_eq!(item["kev_date_added"], json!("2024-06-01"));
        // Base fields survive the partial update.
        assert_eq!(item["description"], json!("base"));
    }

    #[tokio::test]
    async fn empty_contribution_is_skipped_without_a_write() {
        let store = seeded_base(&["CVE-2024-0001"]).await;
        let stats = executor(store.clone())
            .apply(
                &kev_source(),
                vec![change("CVE-2024-0001", &[("unrelated", json!("x"))])],
            )
            .await
            .unwrap();

        assert_eq!(stats.matched, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.updated, 0);
        assert_eq!(store.write_count().await, 1); // only the seed put
    }

    #[tokio::test]
    async fn modification_marker_never_lands_on_the_entity() {
        let store = seeded_base(&["CVE-2024-0001"]).await;

        // A transform that passes the marker through must still see it
        // stripped before the write.
        let source = SourceSpec::dynamic(
            "kev",
            "kev_table",
            "cveID",
            "uploaded_date",
            Arc::new(RenameTransform::new(vec![
                FieldRename::new("kev_date_added", &["dateAdded"]),
                FieldRename::new("uploaded_date", &["uploaded_date"]),
            ])),
        );

        let stats = executor(store.clone())
            .apply(
                &source,
                vec![change(
                    "CVE-2024-0001",
                    &[
                        ("dateAdded", json!("2024-06-01")),
                        ("uploaded_date", json!("2024-06-01T00:00:00Z")),
                    ],
                )],
            )
            .await
            .unwrap();

        assert_eq!(stats.updated, 1);
        let item = store.item("vulns", "CVE-2024-0001").await.unwrap();
        assert_eq!(item["kev_date_added"], json!("2024-06-01"));
        assert!(!item.contains_key("uploaded_date"));
    }

    #[tokio::test]
    async fn record_failure_does_not_abort_the_batch() {
        let store = seeded_base(&["CVE-2024-0001", "CVE-2024-0002"]).await;
        store.fail_updates_for_key("CVE-2024-0001").await;

        let stats = executor(store.clone())
            .apply(
                &kev_source(),
                vec![
                    change("CVE-2024-0001", &[("dateAdded", json!("2024-06-01"))]),
                    change("CVE-2024-0002", &[("dateAdded", json!("2024-06-02"))]),
                ],
            )
            .await
            .unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.updated, 1);
        let item = store.item("vulns", "CVE-2024-0002").await.unwrap();
        assert_eq!(item["kev_date_added"], json!("2024-06-02"));
    }

    #[tokio::test]
    async fn transient_throttling_is_retried() {
        let store = seeded_base(&["CVE-2024-0001"]).await;
        store.throttle_next(1).await;

        let stats = executor(store.clone())
            .apply(
                &kev_source(),
                vec![change("CVE-2024-0001", &[("dateAdded", json!("2024-06-01"))])],
            )
            .await
            .unwrap();

        assert_eq!(stats.failed, 0);
        assert_eq!(stats.updated, 1);
    }

    #[tokio::test]
    async fn disjoint_source_updates_compose() {
        let store = seeded_base(&["CVE-2024-0001"]).await;
        let executor = executor(store.clone());

        executor
            .apply(
                &kev_source(),
                vec![change("CVE-2024-0001", &[("dateAdded", json!("2024-06-01"))])],
            )
            .await
            .unwrap();

        let epss = SourceSpec::fixed(
            "epss",
            "epss_table",
            "cve",
            &[],
            Arc::new(RenameTransform::new(vec![
                FieldRename::new("epss_value", &["epss"]).number(),
            ])),
        );
        executor
            .apply(
                &epss,
                vec![change("CVE-2024-0001", &[("epss", json!(0.93))])],
            )
            .await
            .unwrap();

        let item = store.item("vulns", "CVE-2024-0001").await.unwrap();
        assert_eq!(item["kev_date_added"], json!("2024-06-01"));
        assert_eq!(item["epss_value"], json!(0.93));
        assert_eq!(item["description"], json!("base"));
    }
}
