//! Metrics definitions for synchronizer monitoring.

/// Label for source name in metrics.
pub const SOURCE_LABEL: &str = "source";

/// Label for error kind in metrics.
pub const ERROR_KIND_LABEL: &str = "error_kind";

// Detection metrics

/// Counter for records returned by source scans.
pub const VULNSYNC_RECORDS_SCANNED_TOTAL: &str = "vulnsync_records_scanned_total";

/// Counter for records detected as changed.
pub const VULNSYNC_RECORDS_CHANGED_TOTAL: &str = "vulnsync_records_changed_total";

/// Counter for records dropped for lack of a resolvable join key.
pub const VULNSYNC_RECORDS_DROPPED_TOTAL: &str = "vulnsync_records_dropped_total";

// Join metrics

/// Counter for entity updates written.
pub const VULNSYNC_RECORDS_UPDATED_TOTAL: &str = "vulnsync_records_updated_total";

/// Counter for entity updates that failed after exhausting retries.
pub const VULNSYNC_RECORDS_FAILED_TOTAL: &str = "vulnsync_records_failed_total";

// Pass metrics

/// Counter for completed source passes.
pub const VULNSYNC_SOURCE_PASSES_TOTAL: &str = "vulnsync_source_passes_total";

/// Counter for source passes that failed before their advance decision.
pub const VULNSYNC_SOURCE_FAILURES_TOTAL: &str = "vulnsync_source_failures_total";

/// Gauge for the last committed watermark of a dynamic source, as a Unix
/// timestamp in seconds.
pub const VULNSYNC_WATERMARK_TIMESTAMP: &str = "vulnsync_watermark_timestamp";

/// Gauge for the size of the last persisted baseline of a static source.
pub const VULNSYNC_BASELINE_SIZE: &str = "vulnsync_baseline_size";
