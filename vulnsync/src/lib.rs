//! Incremental multi-source vulnerability join synchronizer.
//!
//! The crate aggregates vulnerability records from independently updated source
//! collections into one unified entity per normalized CVE identifier, stored in a
//! schemaless key-value store. Sources with a modification marker are scanned
//! incrementally behind a per-source watermark; sources without one are diffed
//! against a content-hash baseline kept in a blob store. Changed records are
//! left-joined onto the canonical entity set with non-destructive partial
//! updates, so each source only ever touches its own prefixed field namespace.
//!
//! The entry point is [`pipeline::Pipeline`], which wires the scanner, change
//! detector and join executor together and reports per-source metrics.

pub mod base_load;
pub mod baseline;
pub mod concurrency;
pub mod config;
pub mod cve;
pub mod detect;
pub mod error;
pub mod join;
pub mod macros;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod scanner;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transform;
pub mod types;
pub mod watermark;
