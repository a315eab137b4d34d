//! Sharded filesystem implementation of [`StorageArea`].
//!
//! Blobs are stored under `<root>/<aa>/<bb>/<key>` where `aa` and `bb` are the
//! first four characters of the key, keeping directory fan-out bounded even
//! with millions of blobs. Keys are assigned by the accessor and are at least
//! four characters by construction; shorter keys and keys containing path
//! separators are rejected.

use crate::{StorageArea, StorageError, StorageResult};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Content storage rooted at a single directory.
///
/// The constructor validates the root eagerly and canonicalises it, so all
/// later operations work on a stable absolute path. The service itself is
/// stateless; it can be shared freely across threads.
#[derive(Debug)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// Creates a storage area rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidRootDirectory`] if the root does not
    /// exist, is not a directory, or cannot be canonicalised.
    pub fn new(root: &Path) -> StorageResult<Self> {
        if !root.exists() {
            return Err(StorageError::InvalidRootDirectory(format!(
                "directory does not exist: {}",
                root.display()
            )));
        }

        if !root.is_dir() {
            return Err(StorageError::InvalidRootDirectory(format!(
                "path is not a directory: {}",
                root.display()
            )));
        }

        let root = root.canonicalize().map_err(|e| {
            StorageError::InvalidRootDirectory(format!(
                "cannot canonicalize path {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(Self { root })
    }

    fn blob_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.len() < 4 || key.contains(['/', '\\', '.']) {
            return Err(StorageError::UnknownKey(key.to_owned()));
        }
        Ok(self.root.join(&key[0..2]).join(&key[2..4]).join(key))
    }
}

impl StorageArea for FilesystemStorage {
    fn write(&self, key: &str, content: &[u8]) -> StorageResult<()> {
        let path = self.blob_path(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StorageError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to create blob directory {}: {}", parent.display(), e),
                ))
            })?;
        }

        fs::write(&path, content).map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to write blob to {}: {}", path.display(), e),
            ))
        })
    }

    fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.blob_path(key)?;

        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::UnknownKey(key.to_owned()))
            }
            Err(e) => Err(StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to read blob from {}: {}", path.display(), e),
            ))),
        }
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.blob_path(key)?;

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::UnknownKey(key.to_owned()))
            }
            Err(e) => Err(StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to remove blob at {}: {}", path.display(), e),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (TempDir, FilesystemStorage) {
        let temp = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp.path()).unwrap();
        (temp, storage)
    }

    #[test]
    fn test_new_rejects_missing_root() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("absent");
        assert!(matches!(
            FilesystemStorage::new(&missing),
            Err(StorageError::InvalidRootDirectory(_))
        ));
    }

    #[test]
    fn test_new_rejects_file_root() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("file.txt");
        std::fs::write(&file, "not a directory").unwrap();
        assert!(matches!(
            FilesystemStorage::new(&file),
            Err(StorageError::InvalidRootDirectory(_))
        ));
    }

    #[test]
    fn test_write_read_remove_round_trip() {
        let (_temp, storage) = storage();
        storage.write("abcd1234", b"payload").unwrap();
        assert_eq!(storage.read("abcd1234").unwrap(), b"payload");
        storage.remove("abcd1234").unwrap();
        assert!(matches!(
            storage.read("abcd1234"),
            Err(StorageError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_blobs_are_sharded() {
        let (temp, storage) = storage();
        storage.write("abcd1234", b"x").unwrap();
        assert!(temp.path().join("ab").join("cd").join("abcd1234").is_file());
    }

    #[test]
    fn test_read_unknown_key() {
        let (_temp, storage) = storage();
        assert!(matches!(
            storage.read("ffff0000"),
            Err(StorageError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_rejects_traversal_keys() {
        let (_temp, storage) = storage();
        assert!(storage.write("../../etc/passwd", b"x").is_err());
        assert!(storage.read("ab").is_err());
    }

    #[test]
    fn test_remove_absent_key_is_an_error() {
        let (_temp, storage) = storage();
        assert!(matches!(
            storage.remove("abcd9999"),
            Err(StorageError::UnknownKey(_))
        ));
    }
}
