/*!
Storage adapters for the mempool file.

This module defines the storage abstraction (port) used by the persistence
controller and the crash-safe local filesystem adapter. The controller never
touches the filesystem directly, so tests can swap in an in-memory store.
*/

pub mod local;

use std::path::Path;

use crate::error::IoError;

pub use local::AtomicFileWriter;

/// Storage abstraction for publishing and reading the mempool file
pub trait StorageAdapter: Send + Sync {
    /// Replace the content at `path` with `data` in one indivisible step
    ///
    /// On error the previous content at `path` must be left untouched.
    fn publish(&self, data: &[u8], path: &Path) -> Result<(), IoError>;

    /// Read the complete content at `path`
    ///
    /// A missing file is reported as an error whose kind is
    /// [`std::io::ErrorKind::NotFound`].
    fn read(&self, path: &Path) -> Result<Vec<u8>, IoError>;

    /// Check whether content exists at `path`
    fn exists(&self, path: &Path) -> bool;
}

/// Memory-based storage adapter for testing
///
/// Stores files in a HashMap so controller logic can be tested without
/// touching the filesystem.
#[cfg(test)]
pub struct MemoryStorage {
    data: std::sync::Arc<std::sync::Mutex<std::collections::HashMap<std::path::PathBuf, Vec<u8>>>>,
}

#[cfg(test)]
impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            data: std::sync::Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
        }
    }

    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.data.lock().unwrap().get(path).cloned()
    }

    pub fn put(&self, path: &Path, bytes: Vec<u8>) {
        self.data.lock().unwrap().insert(path.to_path_buf(), bytes);
    }
}

#[cfg(test)]
impl StorageAdapter for MemoryStorage {
    fn publish(&self, data: &[u8], path: &Path) -> Result<(), IoError> {
        self.put(path, data.to_vec());
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, IoError> {
        self.get(path).ok_or_else(|| {
            IoError::new(
                crate::error::IoStage::Read,
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such entry"),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.data.lock().unwrap().contains_key(path)
    }
}
