/*!
Crash-safe local filesystem adapter.

Publishing follows the write-sync-rename pattern:
1. write the full image to `<path>.new`
2. `sync_all` the temporary file
3. rename it over `<path>`
4. sync the parent directory (best effort)

Readers therefore see either the old file or the new one, never a mix. The
temporary file is always a sibling of the target, because a rename across
filesystems is not atomic.
*/

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::StorageAdapter;
use crate::error::{IoError, IoStage};

/// Suffix of the scratch file written before the atomic rename
pub const TEMP_SUFFIX: &str = ".new";

/// Path of the scratch file used while publishing `path`
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Local filesystem storage with atomic replace semantics
///
/// # Example
/// ```rust,no_run
/// use mempersist_core::storage::{AtomicFileWriter, StorageAdapter};
/// use std::path::Path;
///
/// let writer = AtomicFileWriter::new();
/// writer.publish(b"file image", Path::new("/var/lib/node/mempool.dat"))?;
/// # Ok::<(), mempersist_core::IoError>(())
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicFileWriter;

impl AtomicFileWriter {
    pub fn new() -> Self {
        Self
    }

    /// Ensure the parent directory exists, creating it if necessary
    fn ensure_parent_dir(&self, path: &Path) -> Result<(), IoError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| IoError::new(IoStage::CreateTemp, parent, e))?;
            }
        }
        Ok(())
    }

    /// Write and sync `<path>.new`, returning its path
    ///
    /// The canonical file is not touched. If the temporary path cannot be
    /// opened it is left as found; once it has been opened by this call, any
    /// later failure removes it.
    pub fn write_temp(&self, data: &[u8], path: &Path) -> Result<PathBuf, IoError> {
        self.ensure_parent_dir(path)?;
        let temp = temp_path_for(path);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .map_err(|e| IoError::new(IoStage::CreateTemp, &temp, e))?;

        let written = file
            .write_all(data)
            .map_err(|e| IoError::new(IoStage::WriteTemp, &temp, e))
            .and_then(|()| {
                file.sync_all()
                    .map_err(|e| IoError::new(IoStage::SyncTemp, &temp, e))
            });
        drop(file);

        if let Err(e) = written {
            remove_temp(&temp);
            return Err(e);
        }
        Ok(temp)
    }

    /// Atomically move a synced temporary file over `path`
    pub fn commit(&self, temp: &Path, path: &Path) -> Result<(), IoError> {
        if let Err(e) = fs::rename(temp, path) {
            remove_temp(temp);
            return Err(IoError::new(IoStage::Rename, path, e));
        }
        sync_parent_dir(path);
        Ok(())
    }

    /// Whether a leftover scratch file from an earlier failed write exists
    pub fn stale_temp_exists(&self, path: &Path) -> bool {
        temp_path_for(path).exists()
    }

    /// Remove a leftover scratch file, returning whether one was found
    pub fn remove_stale_temp(&self, path: &Path) -> Result<bool, IoError> {
        let temp = temp_path_for(path);
        match fs::remove_file(&temp) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(IoError::new(IoStage::CreateTemp, temp, e)),
        }
    }
}

impl StorageAdapter for AtomicFileWriter {
    fn publish(&self, data: &[u8], path: &Path) -> Result<(), IoError> {
        let temp = self.write_temp(data, path)?;
        self.commit(&temp, path)?;
        debug!("Published {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, IoError> {
        fs::read(path).map_err(|e| IoError::new(IoStage::Read, path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Remove a temporary file this process wrote; failure is only a warning
fn remove_temp(temp: &Path) {
    if let Err(e) = fs::remove_file(temp) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(
                "Failed to remove temporary mempool file {}: {}",
                temp.display(),
                e
            );
        }
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    if let Err(e) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
        debug!("Could not sync directory {}: {}", parent.display(), e);
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
