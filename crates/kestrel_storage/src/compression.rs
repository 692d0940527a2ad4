//! Pluggable key/value compression boundary.
//!
//! The store never guesses: every record that carries a compressed payload
//! says so in its tag bits (log) or its signed length (checkpoint, value
//! location), and the codec is only asked to undo what it did.

use kestrel_common::config::CompressionConfig;
use kestrel_common::error::StorageError;

pub trait CompressionStrategy: Send + Sync {
    fn should_try_compress_key(&self, len: usize) -> bool;

    /// Compress in place. Returns `false` (leaving `buf` untouched) when the
    /// result would not be smaller.
    fn compress_key(&self, buf: &mut Vec<u8>) -> bool;

    fn decompress_key(&self, buf: &mut Vec<u8>) -> Result<(), StorageError>;

    fn compress_value(&self, buf: &mut Vec<u8>) -> bool;

    fn decompress_value(&self, buf: &mut Vec<u8>) -> Result<(), StorageError>;
}

/// Identity codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl CompressionStrategy for NoCompression {
    fn should_try_compress_key(&self, _len: usize) -> bool {
        false
    }

    fn compress_key(&self, _buf: &mut Vec<u8>) -> bool {
        false
    }

    fn decompress_key(&self, _buf: &mut Vec<u8>) -> Result<(), StorageError> {
        Err(StorageError::Compression(
            "payload marked compressed but no codec configured".into(),
        ))
    }

    fn compress_value(&self, _buf: &mut Vec<u8>) -> bool {
        false
    }

    fn decompress_value(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        self.decompress_key(buf)
    }
}

/// zstd frames; only kept when strictly smaller than the input.
#[derive(Debug, Clone)]
pub struct ZstdCompression {
    min_key_len: usize,
    min_value_len: usize,
    level: i32,
}

impl ZstdCompression {
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            min_key_len: config.min_key_len,
            min_value_len: config.min_value_len,
            level: config.level,
        }
    }

    fn try_compress(&self, buf: &mut Vec<u8>) -> bool {
        match zstd::stream::encode_all(buf.as_slice(), self.level) {
            Ok(compressed) if compressed.len() < buf.len() => {
                *buf = compressed;
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::debug!(error = %e, "zstd compression failed, storing raw");
                false
            }
        }
    }

    fn decompress(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        *buf = zstd::stream::decode_all(buf.as_slice())
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        Ok(())
    }
}

impl Default for ZstdCompression {
    fn default() -> Self {
        Self::new(&CompressionConfig::default())
    }
}

impl CompressionStrategy for ZstdCompression {
    fn should_try_compress_key(&self, len: usize) -> bool {
        len >= self.min_key_len
    }

    fn compress_key(&self, buf: &mut Vec<u8>) -> bool {
        self.try_compress(buf)
    }

    fn decompress_key(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        self.decompress(buf)
    }

    fn compress_value(&self, buf: &mut Vec<u8>) -> bool {
        buf.len() >= self.min_value_len && self.try_compress(buf)
    }

    fn decompress_value(&self, buf: &mut Vec<u8>) -> Result<(), StorageError> {
        self.decompress(buf)
    }
}

/// Build the codec selected by configuration.
pub fn from_config(config: &CompressionConfig) -> std::sync::Arc<dyn CompressionStrategy> {
    if config.enabled {
        std::sync::Arc::new(ZstdCompression::new(config))
    } else {
        std::sync::Arc::new(NoCompression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_roundtrip_repetitive_value() {
        let codec = ZstdCompression::default();
        let original = vec![b'k'; 4096];
        let mut buf = original.clone();
        assert!(codec.compress_value(&mut buf));
        assert!(buf.len() < original.len());
        codec.decompress_value(&mut buf).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn test_short_values_left_alone() {
        let codec = ZstdCompression::default();
        let mut buf = vec![0u8; 16];
        assert!(!codec.compress_value(&mut buf));
        assert_eq!(buf, vec![0u8; 16]);
    }

    #[test]
    fn test_key_threshold() {
        let codec = ZstdCompression::default();
        assert!(!codec.should_try_compress_key(10));
        assert!(codec.should_try_compress_key(4096));
    }

    #[test]
    fn test_no_compression_refuses_to_decompress() {
        let mut buf = vec![1, 2, 3];
        assert!(!NoCompression.compress_value(&mut buf));
        assert!(NoCompression.decompress_value(&mut buf).is_err());
    }
}
