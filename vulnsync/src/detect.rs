//! Change detection for dynamic and static sources.
//!
//! A dynamic source carries a modification marker, so changes are the records
//! whose marker is strictly greater than the stored watermark. A static source
//! carries no marker, so changes are detected by diffing content hashes
//! against the persisted baseline.
//!
//! Either way, detection refuses to produce an advance decision over an
//! incomplete scan: advancing a watermark or baseline past records that were
//! never seen would lose them forever.

use tracing::{debug, info, warn};

use crate::baseline::{BaselineEntry, BaselineManager, BaselineMap, content_hash};
use crate::bail;
use crate::cve::{CveId, resolve_join_key};
use crate::error::{ErrorKind, SyncResult};
use crate::scanner::SegmentedScanner;
use crate::store::blob::BlobStore;
use crate::store::kv::{KeyValueStore, ScanFilter};
use crate::transform::{SourceKind, SourceSpec};
use crate::types::{Record, get_str};
use crate::watermark::WatermarkStore;

/// A raw source record paired with its resolved, normalized join key.
#[derive(Debug, Clone)]
pub struct ChangedRecord {
    pub key: CveId,
    pub record: Record,
}

/// What the pipeline should persist once the changed records have been
/// applied to the entity table.
#[derive(Debug, Clone)]
pub enum PassAdvance {
    /// Move the source's watermark to the greatest marker observed, kept as
    /// the raw string the source stamped on the record.
    Watermark { marker: String },
    /// Persist the merged baseline for the source.
    Baseline { merged: BaselineMap },
    /// Nothing changed; leave the stored state alone.
    None,
}

/// Outcome of one detection pass over one source.
#[derive(Debug)]
pub struct SourceChanges {
    pub records: Vec<ChangedRecord>,
    /// Total records the scan returned, changed or not.
    pub scanned: usize,
    /// Records skipped because no field yielded a valid join key.
    pub dropped_keys: usize,
    pub advance: PassAdvance,
}

/// Detects changed records per source, dispatching on the source kind.
#[derive(Debug, Clone)]
pub struct ChangeDetector<K, B> {
    scanner: SegmentedScanner<K>,
    watermarks: WatermarkStore<K>,
    baselines: BaselineManager<B>,
}

impl<K, B> ChangeDetector<K, B>
where
    K: KeyValueStore + Clone + Send + Sync + 'static,
    B: BlobStore,
{
    pub fn new(
        scanner: SegmentedScanner<K>,
        watermarks: WatermarkStore<K>,
        baselines: BaselineManager<B>,
    ) -> Self {
        Self {
            scanner,
            watermarks,
            baselines,
        }
    }

    /// Runs one detection pass and returns the changed records together with
    /// the advance decision the pipeline should commit afterwards.
    pub async fn detect(&self, source: &SourceSpec) -> SyncResult<SourceChanges> {
        match &source.kind {
            SourceKind::Dynamic { marker_field } => {
                self.detect_dynamic(source, marker_field).await
            }
            SourceKind::Static { volatile_fields } => {
                self.detect_static(source, volatile_fields).await
            }
        }
    }

    async fn detect_dynamic(
        &self,
        source: &SourceSpec,
        marker_field: &str,
    ) -> SyncResult<SourceChanges> {
        let last_sync = self.watermarks.get(&source.name).await?;
        let filter = ScanFilter::field_gt(marker_field, last_sync.clone());

        debug!(
            source = %source.name,
            last_sync = %last_sync,
            "scanning dynamic source"
        );

        let outcome = self.scanner.scan(&source.table, Some(filter)).await?;
        if !outcome.is_complete() {
            bail!(
                ErrorKind::ScanIncomplete,
                "Refusing to advance over an incomplete scan",
                format!(
                    "source '{}': {} failed segments",
                    source.name, outcome.failed_segments
                )
            );
        }

        let scanned = outcome.items.len();
        let mut records = Vec::with_capacity(scanned);
        let mut dropped_keys = 0;
        let mut max_marker: Option<String> = None;

        for record in outcome.items {
            let Some(key) = resolve_join_key(&record, &source.join_key_fields) else {
                dropped_keys += 1;
                warn!(source = %source.name, "dropping record without resolvable join key");
                continue;
            };

            // Markers stay raw strings end to end; the watermark must compare
            // lexicographically identically to the scan filter.
            if let Some(marker) = get_str(&record, marker_field)
                && max_marker.as_deref().is_none_or(|current| marker > current)
            {
                max_marker = Some(marker.to_string());
            }

            records.push(ChangedRecord { key, record });
        }

        let advance = match max_marker {
            Some(marker) if !records.is_empty() => PassAdvance::Watermark { marker },
            _ => PassAdvance::None,
        };

        info!(
            source = %source.name,
            scanned,
            changed = records.len(),
            dropped_keys,
            "dynamic detection pass complete"
        );

        Ok(SourceChanges {
            records,
            scanned,
            dropped_keys,
            advance,
        })
    }

    async fn detect_static(
        &self,
        source: &SourceSpec,
        volatile_fields: &[String],
    ) -> SyncResult<SourceChanges> {
        let outcome = self.scanner.scan(&source.table, None).await?;
        if !outcome.is_complete() {
            bail!(
                ErrorKind::ScanIncomplete,
                "Refusing to rebaseline over an incomplete scan",
                format!(
                    "source '{}': {} failed segments",
                    source.name, outcome.failed_segments
                )
            );
        }

        let baseline = self.baselines.load(&source.name).await?;
        let scanned = outcome.items.len();
        let mut records = Vec::new();
        let mut dropped_keys = 0;
        let mut merged = baseline.clone();

        for record in outcome.items {
            let Some(key) = resolve_join_key(&record, &source.join_key_fields) else {
                dropped_keys += 1;
                warn!(source = %source.name, "dropping record without resolvable join key");
                continue;
            };

            let hash = content_hash(&record, volatile_fields)?;
            let changed = baseline
                .get(key.as_str())
                .is_none_or(|entry| entry.content_hash != hash);

            merged.insert(
                key.as_str().to_string(),
                BaselineEntry {
                    record: record.clone(),
                    content_hash: hash,
                },
            );

            if changed {
                records.push(ChangedRecord { key, record });
            }
        }

        let advance = if records.is_empty() {
            PassAdvance::None
        } else {
            PassAdvance::Baseline { merged }
        };

        info!(
            source = %source.name,
            scanned,
            changed = records.len(),
            dropped_keys,
            baseline_size = baseline.len(),
            "static detection pass complete"
        );

        Ok(SourceChanges {
            records,
            scanned,
            dropped_keys,
            advance,
        })
    }
}
