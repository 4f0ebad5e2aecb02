//! The synchronizer pipeline orchestrator.
//!
//! One run is: load the catalog into the entity table, then for each
//! enrichment source detect changes, apply them as a left join onto the
//! entities, and commit the source's advance decision. Sources are isolated;
//! a failing source is reported and the run moves on to the next one. The
//! shutdown signal is honored between passes, never inside one.

use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

use crate::base_load::{BaseLoadStats, BaseLoader, CatalogSpec};
use crate::baseline::BaselineManager;
use crate::concurrency::shutdown::{ShutdownRx, shutdown_requested};
use crate::config::PipelineConfig;
use crate::detect::{ChangeDetector, PassAdvance, SourceChanges};
use crate::error::{ErrorKind, SyncResult};
use crate::join::{JoinExecutor, JoinStats};
use crate::metrics::{
    ERROR_KIND_LABEL, SOURCE_LABEL, VULNSYNC_BASELINE_SIZE, VULNSYNC_RECORDS_CHANGED_TOTAL,
    VULNSYNC_RECORDS_DROPPED_TOTAL, VULNSYNC_RECORDS_FAILED_TOTAL, VULNSYNC_RECORDS_SCANNED_TOTAL,
    VULNSYNC_RECORDS_UPDATED_TOTAL, VULNSYNC_SOURCE_FAILURES_TOTAL,
    VULNSYNC_SOURCE_PASSES_TOTAL, VULNSYNC_WATERMARK_TIMESTAMP,
};
use crate::retry::RetryPolicy;
use crate::scanner::SegmentedScanner;
use crate::store::blob::BlobStore;
use crate::store::kv::KeyValueStore;
use crate::transform::SourceSpec;
use crate::watermark::{WatermarkStore, parse_marker};

/// Outcome of one enrichment source pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Completed {
        scanned: usize,
        changed: usize,
        dropped_keys: usize,
        join: JoinStats,
    },
    /// The pass aborted before its advance decision; stored state is intact.
    Failed { kind: ErrorKind },
    /// The pass never started because shutdown was requested.
    Skipped,
}

/// Outcome of the catalog load pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogStatus {
    Completed(BaseLoadStats),
    Failed { kind: ErrorKind },
    Skipped,
}

/// Per-source outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub name: String,
    pub status: SourceStatus,
    pub duration: Duration,
}

/// Full outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub catalog: CatalogStatus,
    pub sources: Vec<SourceReport>,
}

impl PipelineReport {
    /// Whether any pass failed. Skipped passes are not failures.
    pub fn has_failures(&self) -> bool {
        matches!(self.catalog, CatalogStatus::Failed { .. })
            || self
                .sources
                .iter()
                .any(|report| matches!(report.status, SourceStatus::Failed { .. }))
    }
}

/// Wires the scanner, change detector and join executor together and drives
/// them through one synchronization run.
pub struct Pipeline<K, B> {
    config: PipelineConfig,
    catalog: CatalogSpec,
    sources: Vec<SourceSpec>,
    kv: K,
    blobs: B,
    shutdown_rx: ShutdownRx,
}

impl<K, B> Pipeline<K, B>
where
    K: KeyValueStore + Clone + Send + Sync + 'static,
    B: BlobStore + Clone,
{
    pub fn new(
        config: PipelineConfig,
        catalog: CatalogSpec,
        sources: Vec<SourceSpec>,
        kv: K,
        blobs: B,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            config,
            catalog,
            sources,
            kv,
            blobs,
            shutdown_rx,
        }
    }

    /// Runs one full synchronization pass over the catalog and every source.
    ///
    /// Only configuration errors fail the run as a whole; source passes are
    /// isolated and reported individually.
    pub async fn run(&self) -> SyncResult<PipelineReport> {
        self.config.validate()?;

        let retry = RetryPolicy::from_config(&self.config.retry);
        let scanner =
            SegmentedScanner::new(self.kv.clone(), self.config.scan.clone(), retry.clone())
                .with_shutdown(self.shutdown_rx.clone());
        let watermarks =
            WatermarkStore::new(self.kv.clone(), &self.config.stores.watermark_table);
        let baselines =
            BaselineManager::new(self.blobs.clone(), &self.config.stores.baseline_prefix);

        let loader = BaseLoader::new(
            self.kv.clone(),
            scanner.clone(),
            watermarks.clone(),
            &self.config.stores.entity_table,
            &self.config.stores.entity_key_attr,
            retry.clone(),
            self.config.max_parallel_updates,
        );
        let detector = ChangeDetector::new(scanner, watermarks.clone(), baselines.clone());
        let executor = JoinExecutor::new(
            self.kv.clone(),
            &self.config.stores.entity_table,
            &self.config.stores.entity_key_attr,
            retry,
            self.config.max_parallel_updates,
        );

        info!(sources = self.sources.len(), "starting synchronization run");

        let catalog = if shutdown_requested(&self.shutdown_rx) {
            CatalogStatus::Skipped
        } else {
            match loader.run(&self.catalog).await {
                Ok(stats) => CatalogStatus::Completed(stats),
                Err(err) => {
                    error!(catalog = %self.catalog.name, error = %err, "catalog load failed");
                    counter!(
                        VULNSYNC_SOURCE_FAILURES_TOTAL,
                        SOURCE_LABEL => self.catalog.name.clone(),
                        ERROR_KIND_LABEL => format!("{:?}", err.kind())
                    )
                    .increment(1);
                    CatalogStatus::Failed { kind: err.kind() }
                }
            }
        };

        let mut sources = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let started = Instant::now();
            let status = if shutdown_requested(&self.shutdown_rx) {
                warn!(source = %source.name, "shutdown requested, skipping source");
                SourceStatus::Skipped
            } else {
                match self
                    .run_source(source, &detector, &executor, &watermarks, &baselines)
                    .await
                {
                    Ok(status) => status,
                    Err(err) => {
                        error!(source = %source.name, error = %err, "source pass failed");
                        counter!(
                            VULNSYNC_SOURCE_FAILURES_TOTAL,
                            SOURCE_LABEL => source.name.clone(),
                            ERROR_KIND_LABEL => format!("{:?}", err.kind())
                        )
                        .increment(1);
                        SourceStatus::Failed { kind: err.kind() }
                    }
                }
            };

            sources.push(SourceReport {
                name: source.name.clone(),
                status,
                duration: started.elapsed(),
            });
        }

        let report = PipelineReport { catalog, sources };
        info!(failures = report.has_failures(), "synchronization run complete");

        Ok(report)
    }

    async fn run_source(
        &self,
        source: &SourceSpec,
        detector: &ChangeDetector<K, B>,
        executor: &JoinExecutor<K>,
        watermarks: &WatermarkStore<K>,
        baselines: &BaselineManager<B>,
    ) -> SyncResult<SourceStatus> {
        let SourceChanges {
            records,
            scanned,
            dropped_keys,
            advance,
        } = detector.detect(source).await?;

        counter!(VULNSYNC_RECORDS_SCANNED_TOTAL, SOURCE_LABEL => source.name.clone())
            .increment(scanned as u64);
        counter!(VULNSYNC_RECORDS_CHANGED_TOTAL, SOURCE_LABEL => source.name.clone())
            .increment(records.len() as u64);
        counter!(VULNSYNC_RECORDS_DROPPED_TOTAL, SOURCE_LABEL => source.name.clone())
            .increment(dropped_keys as u64);

        let changed = records.len();
        let join = executor.apply(source, records).await?;

        counter!(VULNSYNC_RECORDS_UPDATED_TOTAL, SOURCE_LABEL => source.name.clone())
            .increment(join.updated as u64);
        counter!(VULNSYNC_RECORDS_FAILED_TOTAL, SOURCE_LABEL => source.name.clone())
            .increment(join.failed as u64);

        // The advance decision is committed once the batch has run to
        // completion. Record-level failures do not block it: every failure
        // was logged and tallied, and holding the whole window back would
        // reprocess thousands of already-applied records to retry a handful.
        match advance {
            PassAdvance::Watermark { marker } => {
                watermarks.advance(&source.name, &marker).await?;
                if let Some(parsed) = parse_marker(&marker) {
                    gauge!(VULNSYNC_WATERMARK_TIMESTAMP, SOURCE_LABEL => source.name.clone())
                        .set(parsed.timestamp() as f64);
                }
            }
            PassAdvance::Baseline { merged } => {
                gauge!(VULNSYNC_BASELINE_SIZE, SOURCE_LABEL => source.name.clone())
                    .set(merged.len() as f64);
                baselines.save(&source.name, &merged).await?;
            }
            PassAdvance::None => {
                debug!(source = %source.name, "no changes, stored state untouched");
            }
        }

        counter!(VULNSYNC_SOURCE_PASSES_TOTAL, SOURCE_LABEL => source.name.clone()).increment(1);

        Ok(SourceStatus::Completed {
            scanned,
            changed,
            dropped_keys,
            join,
        })
    }
}
