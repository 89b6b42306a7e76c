/*!
Error types for the mempool persistence engine.

Each component reports through its own type so callers can match on the
failure kind: the file writer and reader produce [`IoError`], the codec
produces [`FormatError`], the startup loader produces [`LoadError`] and the
on-demand dump produces [`DumpError`]. [`PersistError`] covers configuration
and observability setup.
*/

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used for configuration and setup.
pub type Result<T> = std::result::Result<T, PersistError>;

/// Errors raised while configuring the engine.
#[derive(Error, Debug)]
pub enum PersistError {
    /// I/O errors while reading configuration files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Logging or metrics setup errors
    #[error("Observability error: {0}")]
    Observability(String),
}

impl PersistError {
    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new observability error
    pub fn observability<S: Into<String>>(msg: S) -> Self {
        Self::Observability(msg.into())
    }
}

/// The step of a file operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStage {
    CreateTemp,
    WriteTemp,
    SyncTemp,
    Rename,
    Read,
}

impl fmt::Display for IoStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IoStage::CreateTemp => "create temporary file",
            IoStage::WriteTemp => "write temporary file",
            IoStage::SyncTemp => "sync temporary file",
            IoStage::Rename => "rename temporary file over",
            IoStage::Read => "read",
        };
        f.write_str(text)
    }
}

/// A filesystem failure, carrying the failing step and path.
#[derive(Error, Debug)]
#[error("failed to {stage} {}: {source}", .path.display())]
pub struct IoError {
    pub stage: IoStage,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl IoError {
    pub fn new(stage: IoStage, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self {
            stage,
            path: path.into(),
            source,
        }
    }

    /// The underlying OS error kind
    pub fn kind(&self) -> std::io::ErrorKind {
        self.source.kind()
    }
}

/// The persistence file could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The file was written by an unknown (usually newer) format version
    #[error("unsupported mempool file version {found} (supported: {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },

    /// The file ended before a complete structure could be read
    #[error("mempool file truncated while reading {0}")]
    Truncated(String),

    /// The stored checksum does not match the file content
    #[error("mempool file checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The file does not start with the mempool file magic
    #[error("not a mempool file (bad magic)")]
    BadMagic,

    /// The header names a compression scheme this build does not know
    #[error("unknown compression id {0}")]
    UnknownCompression(u8),

    /// Structurally invalid content inside a checksum-valid body
    #[error("malformed mempool file: {0}")]
    Malformed(String),
}

impl FormatError {
    pub fn truncated<S: Into<String>>(what: S) -> Self {
        Self::Truncated(what.into())
    }

    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::Malformed(msg.into())
    }
}

/// Reading the persistence file at startup failed.
#[derive(Error, Debug)]
pub enum LoadError {
    /// No file at the canonical path; a normal cold start
    #[error("no mempool file at {}", .0.display())]
    NotFound(PathBuf),

    #[error("corrupt mempool file: {0}")]
    Corrupt(#[from] FormatError),

    #[error(transparent)]
    Io(#[from] IoError),
}

/// The pool could not be enumerated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("transaction pool unavailable: {0}")]
pub struct PoolError(pub String);

/// The pool refused to admit a reloaded transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("transaction already in pool")]
    AlreadyInPool,

    #[error("missing inputs")]
    MissingInputs,

    #[error("rejected: {0}")]
    Rejected(String),
}

/// Machine-readable classification of a [`DumpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpErrorKind {
    InProgress,
    Pool,
    Encode,
    Io,
}

/// An on-demand dump did not reach the disk.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("Unable to dump mempool to disk: another dump is in progress")]
    InProgress,

    #[error("Unable to dump mempool to disk: {0}")]
    Pool(#[from] PoolError),

    #[error("Unable to dump mempool to disk: {0}")]
    Encode(#[from] FormatError),

    #[error("Unable to dump mempool to disk: {0}")]
    Io(#[from] IoError),
}

/// Error code reported to request-response callers for every dump failure.
pub const RPC_MISC_ERROR: i32 = -1;

impl DumpError {
    pub fn kind(&self) -> DumpErrorKind {
        match self {
            DumpError::InProgress => DumpErrorKind::InProgress,
            DumpError::Pool(_) => DumpErrorKind::Pool,
            DumpError::Encode(_) => DumpErrorKind::Encode,
            DumpError::Io(_) => DumpErrorKind::Io,
        }
    }

    /// Convert into the structured error handed across a request boundary
    pub fn to_rpc(&self) -> RpcError {
        RpcError {
            code: RPC_MISC_ERROR,
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Structured failure of the `dumpmempool` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub kind: DumpErrorKind,
    pub message: String,
}

impl From<DumpError> for RpcError {
    fn from(err: DumpError) -> Self {
        err.to_rpc()
    }
}
