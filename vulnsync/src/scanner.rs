//! Segmented parallel collection scanner.
//!
//! Source collections are unindexed at the application level, so enumerating
//! matches requires a full scan. The scanner splits the scan into independent
//! segments, runs each segment on its own worker bounded by a permit pool, and
//! pages every segment to exhaustion. Throttling responses are retried with
//! backoff through the shared [`RetryPolicy`]; any other segment failure is
//! logged and counted without cancelling sibling segments, and the caller
//! decides whether a pass with failed segments may be treated as complete.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::concurrency::shutdown::{ShutdownRx, shutdown_requested};
use crate::config::ScanConfig;
use crate::error::{ErrorKind, SyncResult};
use crate::retry::RetryPolicy;
use crate::store::kv::{KeyValueStore, ScanFilter, ScanRequest};
use crate::{bail, sync_error};
use crate::types::Record;

/// Result of a segmented scan.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Items from every segment that completed, in no particular order.
    pub items: Vec<Record>,
    /// Number of segments that failed after exhausting retries.
    ///
    /// A nonzero value means the item list may be incomplete; incremental
    /// passes must not advance their watermark or baseline over it.
    pub failed_segments: usize,
}

impl ScanOutcome {
    /// Whether every segment completed.
    pub fn is_complete(&self) -> bool {
        self.failed_segments == 0
    }
}

/// Scans a whole remote collection through parallel segment workers.
#[derive(Debug, Clone)]
pub struct SegmentedScanner<K> {
    store: K,
    config: ScanConfig,
    retry: RetryPolicy,
    shutdown_rx: Option<ShutdownRx>,
}

impl<K> SegmentedScanner<K>
where
    K: KeyValueStore + Clone + Send + Sync + 'static,
{
    pub fn new(store: K, config: ScanConfig, retry: RetryPolicy) -> Self {
        Self {
            store,
            config,
            retry,
            shutdown_rx: None,
        }
    }

    /// Makes every segment abandon paging once shutdown is signaled. The
    /// aborted segments count as failed, so the pass is never treated as
    /// complete and no watermark or baseline advances over it.
    pub fn with_shutdown(mut self, shutdown_rx: ShutdownRx) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    /// Scans `table` completely, pushing `filter` down to every segment call.
    pub async fn scan(&self, table: &str, filter: Option<ScanFilter>) -> SyncResult<ScanOutcome> {
        let total_segments = self.config.total_segments;
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_segments));

        debug!(
            table,
            segments = total_segments,
            filtered = filter.is_some(),
            "starting segmented scan"
        );

        let mut join_set: JoinSet<(usize, SyncResult<Vec<Record>>)> = JoinSet::new();

        for segment in 0..total_segments {
            let store = self.store.clone();
            let retry = self.retry.clone();
            let table = table.to_string();
            let filter = filter.clone();
            let permits = permits.clone();
            let shutdown_rx = self.shutdown_rx.clone();

            join_set.spawn(async move {
                let permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            segment,
                            Err(sync_error!(
                                ErrorKind::InvalidState,
                                "Scanner permit pool closed"
                            )),
                        );
                    }
                };

                let result = scan_segment(
                    &store,
                    &retry,
                    &table,
                    segment,
                    total_segments,
                    filter,
                    shutdown_rx.as_ref(),
                )
                .await;
                drop(permit);

                (segment, result)
            });
        }

        let mut outcome = ScanOutcome::default();

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(items))) => outcome.items.extend(items),
                Ok((segment, Err(err))) => {
                    error!(table, segment, error = %err, "scan segment failed");
                    outcome.failed_segments += 1;
                }
                Err(join_err) => {
                    let err = sync_error!(
                        ErrorKind::WorkerPanic,
                        "Scan segment worker panicked",
                        source: join_err
                    );
                    error!(table, error = %err, "scan segment worker panicked");
                    outcome.failed_segments += 1;
                }
            }
        }

        debug!(
            table,
            items = outcome.items.len(),
            failed_segments = outcome.failed_segments,
            "segmented scan complete"
        );

        Ok(outcome)
    }
}

/// Pages one segment to exhaustion, retrying each page call on throttling.
async fn scan_segment<K>(
    store: &K,
    retry: &RetryPolicy,
    table: &str,
    segment: usize,
    total_segments: usize,
    filter: Option<ScanFilter>,
    shutdown_rx: Option<&ShutdownRx>,
) -> SyncResult<Vec<Record>>
where
    K: KeyValueStore,
{
    let mut items = Vec::new();
    let mut cursor = None;

    loop {
        if let Some(rx) = shutdown_rx
            && shutdown_requested(rx)
        {
            bail!(
                ErrorKind::ScanIncomplete,
                "Scan abandoned by shutdown request",
                format!("table '{table}', segment {segment}")
            );
        }

        let request = ScanRequest {
            segment,
            total_segments,
            filter: filter.clone(),
            cursor: cursor.clone(),
        };

        let page = retry
            .retry("scan", || store.scan(table, request.clone()))
            .await?;

        items.extend(page.items);

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(items)
}
