//! Configuration for mempool persistence
//!
//! The configuration is read once at process start. `persist_mempool` in
//! particular is not hot-reloadable: a controller built from a config keeps
//! its value for its whole lifetime.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::compression::CompressionKind;
use crate::storage::local::temp_path_for;

/// Default file name of the canonical mempool file
pub const DEFAULT_FILE_NAME: &str = "mempool.dat";

/// Default age after which reloaded transactions are dropped (two weeks)
pub const DEFAULT_EXPIRY_HOURS: u64 = 336;

fn default_true() -> bool {
    true
}

fn default_file_name() -> String {
    DEFAULT_FILE_NAME.to_string()
}

fn default_expiry_hours() -> u64 {
    DEFAULT_EXPIRY_HOURS
}

/// Persistence settings for one node instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistConfig {
    /// Node data directory; the mempool file lives directly inside it
    pub data_dir: PathBuf,
    /// File name of the canonical mempool file
    #[serde(default = "default_file_name")]
    pub file_name: String,
    /// Load at startup and dump at shutdown
    #[serde(default = "default_true")]
    pub persist_mempool: bool,
    /// Reloaded transactions older than this many hours are skipped
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: u64,
    /// Compression applied to the file body
    #[serde(default)]
    pub compression: CompressionKind,
}

impl PersistConfig {
    /// Defaults for a node rooted at `data_dir`
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            file_name: default_file_name(),
            persist_mempool: true,
            expiry_hours: DEFAULT_EXPIRY_HOURS,
            compression: CompressionKind::None,
        }
    }

    pub fn with_persist_mempool(mut self, enabled: bool) -> Self {
        self.persist_mempool = enabled;
        self
    }

    pub fn with_file_name<S: Into<String>>(mut self, file_name: S) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn with_expiry_hours(mut self, hours: u64) -> Self {
        self.expiry_hours = hours;
        self
    }

    pub fn with_compression(mut self, compression: CompressionKind) -> Self {
        self.compression = compression;
        self
    }

    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: PersistConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// The file name must be a bare name so the scratch file is always a
    /// sibling of the canonical file on the same filesystem.
    pub fn validate(&self) -> crate::Result<()> {
        if self.file_name.is_empty() {
            return Err(crate::PersistError::validation(
                "mempool file name cannot be empty",
            ));
        }
        if self.file_name.contains(['/', '\\']) || self.file_name == "." || self.file_name == ".." {
            return Err(crate::PersistError::validation(format!(
                "mempool file name '{}' must not contain a path",
                self.file_name
            )));
        }
        if self.expiry_hours == 0 {
            return Err(crate::PersistError::validation(
                "expiry_hours must be at least 1",
            ));
        }
        Ok(())
    }

    /// Canonical mempool file path
    pub fn mempool_path(&self) -> PathBuf {
        self.data_dir.join(&self.file_name)
    }

    /// Scratch path written during a dump
    pub fn temp_path(&self) -> PathBuf {
        temp_path_for(&self.mempool_path())
    }

    pub fn expiry(&self) -> Duration {
        // chrono durations are bounded by i64 milliseconds
        let max_hours = i64::MAX / 3_600_000;
        let hours = i64::try_from(self.expiry_hours).map_or(max_hours, |h| h.min(max_hours));
        Duration::hours(hours)
    }
}
