/*!
Compression adapters for the mempool file body.

The header of every mempool file records which adapter compressed the body,
so a reader can always pick the matching decompressor regardless of how the
current node is configured.
*/

use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};

use crate::error::FormatError;

/// Compression abstraction for the snapshot body
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FormatError>;

    /// Decompress the input data
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>, FormatError>;

    /// Identifier stored in the file header
    fn id(&self) -> u8;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Compression choice as it appears in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    None,
    Gzip,
}

impl CompressionKind {
    pub fn adapter(self) -> Box<dyn CompressionAdapter> {
        match self {
            CompressionKind::None => Box::new(NoCompression::new()),
            CompressionKind::Gzip => Box::new(GzipCompressor::new()),
        }
    }
}

impl CompressionAdapter for Box<dyn CompressionAdapter> {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FormatError> {
        (**self).compress(data)
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>, FormatError> {
        (**self).decompress(compressed_data)
    }

    fn id(&self) -> u8 {
        (**self).id()
    }

    fn algorithm_name(&self) -> &str {
        (**self).algorithm_name()
    }
}

/// Look up the adapter that produced a body with header id `id`
pub fn adapter_for_id(id: u8) -> Result<Box<dyn CompressionAdapter>, FormatError> {
    match id {
        NoCompression::ID => Ok(Box::new(NoCompression::new())),
        GzipCompressor::ID => Ok(Box::new(GzipCompressor::new())),
        other => Err(FormatError::UnknownCompression(other)),
    }
}

/// Gzip compression adapter
///
/// Uses DEFLATE via `flate2`. The gzip header carries no timestamp, so the
/// same input always yields the same bytes.
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    pub const ID: u8 = 1;

    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FormatError> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder
            .write_all(data)
            .map_err(|e| FormatError::malformed(format!("failed to compress body: {e}")))?;

        encoder
            .finish()
            .map_err(|e| FormatError::malformed(format!("failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>, FormatError> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| FormatError::malformed(format!("failed to decompress body: {e}")))?;

        Ok(decompressed)
    }

    fn id(&self) -> u8 {
        Self::ID
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Pass-through adapter; the default for mempool files
#[derive(Debug, Clone, Copy)]
pub struct NoCompression;

impl NoCompression {
    pub const ID: u8 = 0;

    pub fn new() -> Self {
        Self
    }
}

impl Default for NoCompression {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FormatError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>, FormatError> {
        Ok(compressed_data.to_vec())
    }

    fn id(&self) -> u8 {
        Self::ID
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_compression_roundtrip() {
        let compressor = GzipCompressor::new();
        let original_data = b"raw transaction bytes with plenty of repetition ".repeat(20);

        let compressed = compressor.compress(&original_data).unwrap();
        assert!(compressed.len() < original_data.len());

        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(original_data, decompressed);
    }

    #[test]
    fn test_gzip_is_deterministic() {
        let compressor = GzipCompressor::with_level(9);
        let data = b"same input, same output".repeat(8);
        assert_eq!(
            compressor.compress(&data).unwrap(),
            compressor.compress(&data).unwrap()
        );
    }

    #[test]
    fn test_gzip_invalid_compressed_data() {
        let compressor = GzipCompressor::new();
        let result = compressor.decompress(b"this is not gzip data");
        assert!(matches!(result, Err(FormatError::Malformed(_))));
    }

    #[test]
    fn test_adapter_lookup_by_id() {
        assert_eq!(adapter_for_id(0).unwrap().algorithm_name(), "none");
        assert_eq!(adapter_for_id(1).unwrap().algorithm_name(), "gzip");
        assert!(matches!(
            adapter_for_id(9),
            Err(FormatError::UnknownCompression(9))
        ));
    }

    #[test]
    fn test_kind_maps_to_adapter() {
        assert_eq!(CompressionKind::default(), CompressionKind::None);
        assert_eq!(CompressionKind::Gzip.adapter().id(), GzipCompressor::ID);
    }
}
