//! Blob storage for the Opal imaging store.
//!
//! This crate defines the storage-area boundary the orchestration core writes
//! blobs through, together with the default content-addressed filesystem
//! implementation and the [`StorageAccessor`] wrapper that adds optional
//! compression and digest bookkeeping on top of any area.
//!
//! The storage model is deliberately dumb: an area maps opaque keys to byte
//! sequences and knows nothing about resources, attachments or compression.
//! All interpretation lives in the accessor and above, so alternate areas
//! (object stores, in-memory fakes for tests) only implement three methods.

mod accessor;
mod area;
mod filesystem;

pub use accessor::{StorageAccessor, StoredBlob};
pub use area::StorageArea;
pub use filesystem::FilesystemStorage;

/// Errors raised by storage areas and the accessor.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The configured storage root is missing, not a directory, or cannot be
    /// canonicalised.
    #[error("invalid storage root: {0}")]
    InvalidRootDirectory(String),
    /// The requested key is not present in the storage area.
    #[error("no blob stored under key {0}")]
    UnknownKey(String),
    /// A blob's content no longer matches the digest recorded when it was
    /// written.
    #[error("digest mismatch for key {key}: stored content hashes to {actual}")]
    DigestMismatch { key: String, actual: String },
    /// Compressed blob could not be decoded.
    #[error("failed to decompress blob {key}: {source}")]
    Decompression {
        key: String,
        #[source]
        source: std::io::Error,
    },
    /// Underlying I/O failure, with path context attached by the area.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
