//! Compressing, digest-recording wrapper around a [`StorageArea`].

use crate::{StorageArea, StorageError, StorageResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Handle to a blob written through the accessor.
///
/// Everything needed to read the blob back (key, compression flag) and to
/// verify or deduplicate it (digest, size) travels in this record; the index
/// persists it as part of the attachment row.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoredBlob {
    /// Opaque storage key assigned at write time.
    pub key: String,
    /// Hex SHA-256 of the uncompressed content, when digest bookkeeping is
    /// enabled.
    pub digest: Option<String>,
    /// Size of the uncompressed content in bytes.
    pub uncompressed_size: u64,
    /// Whether the stored bytes are gzip-compressed.
    pub is_compressed: bool,
}

/// Storage accessor adding optional compression and content digests on top of
/// a raw [`StorageArea`].
///
/// Compression and digest bookkeeping are runtime-togglable (they mirror
/// server configuration that an administrator can change between restarts of
/// individual subsystems), so both flags are atomics and all methods take
/// `&self`.
pub struct StorageAccessor {
    area: Box<dyn StorageArea>,
    compression_enabled: AtomicBool,
    store_digest: AtomicBool,
}

impl StorageAccessor {
    pub fn new(area: Box<dyn StorageArea>) -> Self {
        Self {
            area,
            compression_enabled: AtomicBool::new(false),
            store_digest: AtomicBool::new(true),
        }
    }

    pub fn set_compression_enabled(&self, enabled: bool) {
        self.compression_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_compression_enabled(&self) -> bool {
        self.compression_enabled.load(Ordering::Relaxed)
    }

    /// Controls whether a SHA-256 digest is recorded for new blobs. Digests
    /// enable integrity verification on read and content-based deduplication;
    /// disabling them trades that away for hashing cost.
    pub fn set_store_digest(&self, enabled: bool) {
        self.store_digest.store(enabled, Ordering::Relaxed);
    }

    pub fn is_store_digest(&self) -> bool {
        self.store_digest.load(Ordering::Relaxed)
    }

    /// Computes the digest that [`StorageAccessor::write`] would record for
    /// `content`, independent of the bookkeeping flag. Used by write paths
    /// that deduplicate before persisting anything.
    pub fn content_digest(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }

    /// Persists `content` under a freshly assigned key.
    ///
    /// The content is compressed when compression is enabled, and its digest
    /// recorded when digest bookkeeping is enabled.
    pub fn write(&self, content: &[u8]) -> StorageResult<StoredBlob> {
        let key = Uuid::new_v4().simple().to_string();
        let compress = self.is_compression_enabled();

        let digest = if self.is_store_digest() {
            Some(Self::content_digest(content))
        } else {
            None
        };

        if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(content)?;
            let compressed = encoder.finish()?;
            self.area.write(&key, &compressed)?;
        } else {
            self.area.write(&key, content)?;
        }

        tracing::debug!(
            "wrote blob {} ({} bytes{})",
            key,
            content.len(),
            if compress { ", compressed" } else { "" }
        );

        Ok(StoredBlob {
            key,
            digest,
            uncompressed_size: content.len() as u64,
            is_compressed: compress,
        })
    }

    /// Reads a blob back, decompressing if it was stored compressed and
    /// verifying its digest when one was recorded.
    ///
    /// # Errors
    ///
    /// - [`StorageError::UnknownKey`] if the blob is gone,
    /// - [`StorageError::Decompression`] if the compressed payload is invalid,
    /// - [`StorageError::DigestMismatch`] if the content no longer hashes to
    ///   the recorded digest.
    pub fn read(&self, blob: &StoredBlob) -> StorageResult<Vec<u8>> {
        let raw = self.area.read(&blob.key)?;

        let content = if blob.is_compressed {
            let mut decoder = GzDecoder::new(raw.as_slice());
            let mut out = Vec::with_capacity(blob.uncompressed_size as usize);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| StorageError::Decompression {
                    key: blob.key.clone(),
                    source: e,
                })?;
            out
        } else {
            raw
        };

        if let Some(expected) = &blob.digest {
            let actual = Self::content_digest(&content);
            if &actual != expected {
                return Err(StorageError::DigestMismatch {
                    key: blob.key.clone(),
                    actual,
                });
            }
        }

        Ok(content)
    }

    /// Removes a blob from the area.
    pub fn remove(&self, key: &str) -> StorageResult<()> {
        self.area.remove(key)?;
        tracing::debug!("removed blob {}", key);
        Ok(())
    }
}

impl std::fmt::Debug for StorageAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAccessor")
            .field("compression_enabled", &self.is_compression_enabled())
            .field("store_digest", &self.is_store_digest())
            .finish_non_exhaustive()
    }
}
