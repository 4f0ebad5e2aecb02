//! Storage capabilities consumed by the synchronizer.
//!
//! The engine does not implement its own storage; it consumes an existing
//! key-value store and an existing blob store as opaque capabilities. The
//! traits here define exactly the operations the pipeline needs, and
//! [`memory::MemoryStore`] provides an in-process implementation of both used
//! for development and tests.

pub mod blob;
pub mod expression;
pub mod kv;
pub mod memory;
