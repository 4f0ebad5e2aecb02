//! Seeds and refreshes the unified entity table from the catalog source.
//!
//! The catalog is the authoritative enumeration of vulnerability identifiers.
//! Every entity row originates here; enrichment sources only ever join onto
//! rows this loader created. New catalog records become full entity rows,
//! while records for entities that already exist are applied as partial
//! updates so enrichment fields written by other sources survive the refresh.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::bail;
use crate::cve::resolve_join_key;
use crate::error::{ErrorKind, SyncResult};
use crate::retry::RetryPolicy;
use crate::scanner::SegmentedScanner;
use crate::store::expression::UpdateExpression;
use crate::store::kv::{KeyValueStore, ScanFilter};
use crate::sync_error;
use crate::transform::SourceTransform;
use crate::types::get_str;
use crate::watermark::WatermarkStore;

/// Static configuration of the catalog source.
#[derive(Clone)]
pub struct CatalogSpec {
    pub name: String,
    pub table: String,
    pub join_key_fields: Vec<String>,
    pub marker_field: String,
    pub transform: Arc<dyn SourceTransform>,
}

/// Tally of one base load pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BaseLoadStats {
    pub scanned: usize,
    /// Entities created for catalog records not seen before.
    pub created: usize,
    /// Existing entities refreshed with current catalog fields.
    pub refreshed: usize,
    pub dropped_keys: usize,
    pub failed: usize,
}

/// Loads new and modified catalog records into the entity table.
#[derive(Clone)]
pub struct BaseLoader<K> {
    store: K,
    scanner: SegmentedScanner<K>,
    watermarks: WatermarkStore<K>,
    entity_table: String,
    key_attr: String,
    retry: RetryPolicy,
    max_parallel_writes: usize,
}

impl<K> BaseLoader<K>
where
    K: KeyValueStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        store: K,
        scanner: SegmentedScanner<K>,
        watermarks: WatermarkStore<K>,
        entity_table: impl Into<String>,
        key_attr: impl Into<String>,
        retry: RetryPolicy,
        max_parallel_writes: usize,
    ) -> Self {
        Self {
            store,
            scanner,
            watermarks,
            entity_table: entity_table.into(),
            key_attr: key_attr.into(),
            retry,
            max_parallel_writes: max_parallel_writes.max(1),
        }
    }

    /// Runs one base load pass. The catalog watermark only advances when the
    /// pass wrote every changed record, so a partially failed pass is retried
    /// in full on the next run.
    pub async fn run(&self, catalog: &CatalogSpec) -> SyncResult<BaseLoadStats> {
        let last_sync = self.watermarks.get(&catalog.name).await?;
        let filter = ScanFilter::field_gt(&catalog.marker_field, last_sync);

        let outcome = self.scanner.scan(&catalog.table, Some(filter)).await?;
        if !outcome.is_complete() {
            bail!(
                ErrorKind::ScanIncomplete,
                "Refusing to load the catalog from an incomplete scan",
                format!("{} failed segments", outcome.failed_segments)
            );
        }

        let mut stats = BaseLoadStats {
            scanned: outcome.items.len(),
            ..BaseLoadStats::default()
        };

        if outcome.items.is_empty() {
            info!(catalog = %catalog.name, "catalog unchanged, nothing to load");
            return Ok(stats);
        }

        let existing = self.entity_key_set().await?;

        let mut tasks: JoinSet<SyncResult<()>> = JoinSet::new();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel_writes));
        let mut max_marker: Option<String> = None;

        for record in outcome.items {
            let Some(key) = resolve_join_key(&record, &catalog.join_key_fields) else {
                stats.dropped_keys += 1;
                warn!(catalog = %catalog.name, "dropping catalog record without join key");
                continue;
            };

            // Raw lexicographic max, matching the scan filter's comparison.
            if let Some(marker) = get_str(&record, &catalog.marker_field)
                && max_marker.as_deref().is_none_or(|current| marker > current)
            {
                max_marker = Some(marker.to_string());
            }

            let fields = catalog.transform.apply(&record);
            let is_new = !existing.contains(key.as_str());
            if is_new {
                stats.created += 1;
            } else {
                stats.refreshed += 1;
            }

            let store = self.store.clone();
            let table = self.entity_table.clone();
            let key_attr = self.key_attr.clone();
            let retry = self.retry.clone();
            let key = key.into_string();
            let permits = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(sync_error!(
                            ErrorKind::InvalidState,
                            "Write permit pool closed"
                        ));
                    }
                };

                if is_new {
                    let mut item = fields;
                    item.insert(key_attr, Value::String(key));
                    retry
                        .retry("put_item", || store.put_item(&table, item.clone()))
                        .await
                } else {
                    let update = UpdateExpression::builder(&key_attr).set_fields(fields).build();
                    if update.is_empty() {
                        return Ok(());
                    }
                    retry
                        .retry("update_item", || {
                            store.update_item(&table, &key, update.clone())
                        })
                        .await
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    stats.failed += 1;
                    error!(catalog = %catalog.name, error = %err, "catalog write failed");
                }
                Err(join_err) => {
                    stats.failed += 1;
                    let err = sync_error!(
                        ErrorKind::WorkerPanic,
                        "Catalog write task panicked",
                        source: join_err
                    );
                    error!(catalog = %catalog.name, error = %err, "catalog write task panicked");
                }
            }
        }

        if stats.failed == 0 {
            if let Some(marker) = max_marker {
                self.watermarks.advance(&catalog.name, &marker).await?;
            }
        } else {
            warn!(
                catalog = %catalog.name,
                failed = stats.failed,
                "holding catalog watermark back after write failures"
            );
        }

        info!(
            catalog = %catalog.name,
            scanned = stats.scanned,
            created = stats.created,
            refreshed = stats.refreshed,
            dropped_keys = stats.dropped_keys,
            failed = stats.failed,
            "base load pass complete"
        );

        Ok(stats)
    }

    /// Full key set of the entity table. A complete scan is required: an
    /// unseen existing key would be re-put as a fresh row, erasing every
    /// enrichment field other sources have written onto it.
    async fn entity_key_set(&self) -> SyncResult<HashSet<String>> {
        let outcome = self.scanner.scan(&self.entity_table, None).await?;
        if !outcome.is_complete() {
            bail!(
                ErrorKind::ScanIncomplete,
                "Refusing to load the catalog without the full entity key set",
                format!("{} failed segments", outcome.failed_segments)
            );
        }

        Ok(outcome
            .items
            .into_iter()
            .filter_map(|item| {
                item.get(&self.key_attr)
                    .and_then(|value| value.as_str())
                    .map(str::to_string)
            })
            .collect())
    }
}
