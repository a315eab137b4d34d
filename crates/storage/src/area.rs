//! The storage-area boundary trait.

use crate::StorageResult;

/// A keyed blob store.
///
/// Implementations must be safe for concurrent access to *different* keys.
/// Concurrent access to the same key is not contracted; callers serialize it
/// through the index transaction that owns the key's lifecycle.
pub trait StorageArea: Send + Sync {
    /// Persists `content` under `key`, overwriting any previous value.
    fn write(&self, key: &str, content: &[u8]) -> StorageResult<()>;

    /// Reads the blob stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::UnknownKey`] if no blob is stored under
    /// `key`.
    fn read(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Removes the blob stored under `key`.
    ///
    /// Removing an absent key is an error ([`crate::StorageError::UnknownKey`])
    /// so that compensation paths can tell "already gone" from "deleted now".
    fn remove(&self, key: &str) -> StorageResult<()>;
}
