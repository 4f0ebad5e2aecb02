//! Builders for source records used across tests.

use serde_json::{Value, json};

use crate::types::Record;

/// Builds a record from field-value pairs.
pub fn record(pairs: &[(&str, Value)]) -> Record {
    let mut record = Record::new();
    for (field, value) in pairs {
        record.insert((*field).to_string(), value.clone());
    }
    record
}

/// A catalog record the way the vulnerability catalog publishes them.
pub fn catalog_record(id: &str, description: &str, uploaded: &str) -> Record {
    record(&[
        ("cve_id", json!(id)),
        ("description", json!(description)),
        ("uploaded_date", json!(uploaded)),
    ])
}

/// An exploited-vulnerability record with a modification marker.
pub fn kev_record(id: &str, date_added: &str, uploaded: &str) -> Record {
    record(&[
        ("cveID", json!(id)),
        ("dateAdded", json!(date_added)),
        ("uploaded_date", json!(uploaded)),
    ])
}

/// An exploit-probability record. `fetched` is the volatile fetch timestamp
/// that changes on every upload without the scores changing.
pub fn epss_record(id: &str, score: f64, fetched: &str) -> Record {
    record(&[
        ("cve", json!(id)),
        ("epss", json!(score)),
        ("percentile", json!(score)),
        ("fetched_at", json!(fetched)),
    ])
}
