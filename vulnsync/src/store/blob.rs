//! Blob store capability trait.

use std::future::Future;

use crate::error::SyncResult;

/// Capability trait for the blob store holding per-source baselines.
///
/// Objects are read and written whole; the synchronizer performs
/// read-modify-write at object granularity and never depends on partial
/// updates.
pub trait BlobStore {
    /// Reads an object, or `None` when the path does not exist.
    fn get_object(&self, path: &str) -> impl Future<Output = SyncResult<Option<Vec<u8>>>> + Send;

    /// Writes an object, replacing any previous content at the path.
    fn put_object(
        &self,
        path: &str,
        bytes: Vec<u8>,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}
