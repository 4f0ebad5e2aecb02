//! Shared fixtures for the pipeline integration tests.

use std::sync::Arc;

use vulnsync::base_load::CatalogSpec;
use vulnsync::config::{PipelineConfig, RetryConfig, ScanConfig, StoreLocations};
use vulnsync::store::kv::KeyValueStore;
use vulnsync::store::memory::MemoryStore;
use vulnsync::transform::{FieldRename, RenameTransform, SourceSpec};
use vulnsync::types::Record;

pub use vulnsync::test_utils::records::{catalog_record, epss_record, kev_record};

pub const ENTITY_TABLE: &str = "vulns";
pub const KEY_ATTR: &str = "cve_id";

pub fn config() -> PipelineConfig {
    PipelineConfig {
        stores: StoreLocations {
            entity_table: ENTITY_TABLE.into(),
            entity_key_attr: KEY_ATTR.into(),
            watermark_table: "watermarks".into(),
            baseline_prefix: "baselines".into(),
        },
        scan: ScanConfig {
            total_segments: 4,
            max_parallel_segments: 4,
        },
        retry: RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        max_parallel_updates: 4,
    }
}

pub fn catalog() -> CatalogSpec {
    CatalogSpec {
        name: "nvd".into(),
        table: "nvd_table".into(),
        join_key_fields: vec!["cve_id".into()],
        marker_field: "uploaded_date".into(),
        transform: Arc::new(RenameTransform::new(vec![
            FieldRename::new("description", &["description"]),
            FieldRename::new("cvss_score", &["cvss_score", "baseScore"]).number(),
        ])),
    }
}

pub fn kev_source() -> SourceSpec {
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

pub fn epss_source() -> SourceSpec {
    SourceSpec::fixed(
        "epss",
        "epss_table",
        "cve",
        &["fetched_at"],
        Arc::new(RenameTransform::new(vec![
            FieldRename::new("epss_value", &["epss"]).number(),
            FieldRename::new("epss_percentile", &["percentile"]).number(),
        ])),
    )
}

/// A store with every table the pipeline expects, but no records yet.
pub async fn empty_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.create_table(ENTITY_TABLE, KEY_ATTR).await;
    store.create_table("watermarks", "source_table").await;
    store.create_table("nvd_table", "cve_id").await;
    store.create_table("kev_table", "cveID").await;
    store.create_table("epss_table", "cve").await;
    store
}

pub async fn put(store: &MemoryStore, table: &str, item: Record) {
    store.put_item(table, item).await.unwrap();
}
