//! Per-source watermark storage.
//!
//! A watermark is the last-successfully-processed modification marker of a
//! dynamic source. Markers are carried as the raw strings the source stamps
//! on its records and compared lexicographically, the same way the scan
//! filter compares them; parsing and re-rendering them would silently drop
//! precision the source encodes (fractional seconds in particular) and lose
//! the records hiding behind it. The watermark only bounds incremental scans;
//! correctness comes from the change detector combining it with scan results,
//! never from the watermark alone.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;

use crate::error::SyncResult;
use crate::store::kv::KeyValueStore;
use crate::types::{Record, get_str};

/// Key attribute of the watermark table.
pub const SOURCE_ATTR: &str = "source_table";
/// Attribute holding the RFC 3339 watermark value.
pub const LAST_SYNC_ATTR: &str = "last_sync_time";

/// The sentinel watermark for sources that have never synced. Sorts below
/// every real RFC 3339 marker.
pub const EPOCH_MARKER: &str = "1970-01-01T00:00:00Z";

/// Parses a record's modification marker into a timestamp, for reporting
/// only. Markers that fail to parse are treated as absent rather than fatal;
/// watermark comparisons never go through this.
pub fn parse_marker(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Small key-value mapping from source name to its last sync marker.
#[derive(Debug, Clone)]
pub struct WatermarkStore<K> {
    store: K,
    table: String,
}

impl<K> WatermarkStore<K>
where
    K: KeyValueStore,
{
    pub fn new(store: K, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
        }
    }

    /// Returns the watermark for `source`, or the epoch sentinel when the
    /// source has never completed a pass. Absence is not an error.
    pub async fn get(&self, source: &str) -> SyncResult<String> {
        let Some(item) = self.store.get_item(&self.table, source).await? else {
            return Ok(EPOCH_MARKER.to_string());
        };

        match get_str(&item, LAST_SYNC_ATTR) {
            Some(raw) => Ok(raw.to_string()),
            None => Ok(EPOCH_MARKER.to_string()),
        }
    }

    /// Overwrites the watermark for `source` with the marker verbatim.
    /// Idempotent.
    ///
    /// Callers must only invoke this after the source's join batch has fully
    /// completed; advancing ahead of durability would silently lose updates on
    /// a crash.
    pub async fn advance(&self, source: &str, marker: &str) -> SyncResult<()> {
        let mut item = Record::new();
        item.insert(SOURCE_ATTR.to_string(), Value::String(source.to_string()));
        item.insert(
            LAST_SYNC_ATTR.to_string(),
            Value::String(marker.to_string()),
        );

        self.store.put_item(&self.table, item).await?;

        info!(source, watermark = marker, "watermark advanced");

        Ok(())
    }
}
