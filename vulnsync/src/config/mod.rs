//! Configuration for the synchronizer pipeline.
//!
//! All table names, scan knobs and retry settings are carried by an explicit
//! [`PipelineConfig`] passed into the orchestrator constructor. There are no
//! global singletons; configuration errors are fatal at startup and never
//! retried.

use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

/// Top-level configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Locations of the stores the pipeline consumes.
    pub stores: StoreLocations,
    /// Scanner parallelism settings.
    #[serde(default)]
    pub scan: ScanConfig,
    /// Retry policy settings shared by the scanner and the join writer.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Maximum number of record updates applied concurrently during a join.
    #[serde(default = "default_max_parallel_updates")]
    pub max_parallel_updates: usize,
}

/// Names of the key-value tables and the blob prefix the pipeline reads and
/// writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreLocations {
    /// Table holding the unified entities.
    pub entity_table: String,
    /// Name of the entity partition key attribute.
    #[serde(default = "default_entity_key_attr")]
    pub entity_key_attr: String,
    /// Table holding per-source watermarks.
    pub watermark_table: String,
    /// Blob path prefix under which per-source baselines are stored.
    pub baseline_prefix: String,
}

/// Tunables for the segmented parallel scanner.
///
/// Segment count is a tunable, not a constant: too many segments triggers
/// store-side throttling, too few makes large scans slow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Number of independent segments a collection scan is split into.
    #[serde(default = "default_total_segments")]
    pub total_segments: usize,
    /// Maximum number of segments scanned concurrently. Caps simultaneous
    /// outbound connections independently of the logical segment count.
    #[serde(default = "default_max_parallel_segments")]
    pub max_parallel_segments: usize,
}

/// Settings for the shared exponential backoff retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per operation, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound in milliseconds for any single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_entity_key_attr() -> String {
    "cve_id".to_string()
}

const fn default_total_segments() -> usize {
    8
}

const fn default_max_parallel_segments() -> usize {
    8
}

const fn default_max_parallel_updates() -> usize {
    16
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    200
}

const fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            total_segments: default_total_segments(),
            max_parallel_segments: default_max_parallel_segments(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl PipelineConfig {
    /// Validates the configuration, failing fast on anything that would make a
    /// run meaningless.
    pub fn validate(&self) -> SyncResult<()> {
        if self.stores.entity_table.is_empty() {
            bail!(ErrorKind::ConfigError, "Missing entity table name");
        }
        if self.stores.entity_key_attr.is_empty() {
            bail!(ErrorKind::ConfigError, "Missing entity key attribute name");
        }
        if self.stores.watermark_table.is_empty() {
            bail!(ErrorKind::ConfigError, "Missing watermark table name");
        }
        if self.stores.baseline_prefix.is_empty() {
            bail!(ErrorKind::ConfigError, "Missing baseline blob prefix");
        }
        if self.scan.total_segments == 0 {
            bail!(ErrorKind::ConfigError, "Scan segment count must be nonzero");
        }
        if self.scan.max_parallel_segments == 0 {
            bail!(
                ErrorKind::ConfigError,
                "Scanner parallelism must be nonzero"
            );
        }
        if self.max_parallel_updates == 0 {
            bail!(ErrorKind::ConfigError, "Join parallelism must be nonzero");
        }
        if self.retry.max_attempts == 0 {
            bail!(ErrorKind::ConfigError, "Retry attempts must be nonzero");
        }

        Ok(())
    }
}
