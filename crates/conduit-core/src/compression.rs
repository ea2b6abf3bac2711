//! Named compressors and request/response compression negotiation.
//!
//! Built in: gzip (flate2) and zstd. `identity` is implicit and never stored
//! in a registry.

use crate::code::Code;
use crate::error::Error;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

pub const COMPRESSION_IDENTITY: &str = "identity";
pub const COMPRESSION_GZIP: &str = "gzip";
pub const COMPRESSION_ZSTD: &str = "zstd";

/// Default zstd compression level
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Compression errors
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compress: {0}")]
    Compress(#[source] std::io::Error),

    #[error("decompress: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("decompressed message exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

impl From<CompressionError> for Error {
    fn from(err: CompressionError) -> Self {
        let code = match err {
            CompressionError::Compress(_) => Code::Internal,
            CompressionError::Decompress(_) => Code::InvalidArgument,
            CompressionError::TooLarge { .. } => Code::ResourceExhausted,
        };
        Error::from_source(code, err)
    }
}

/// A named compressor/decompressor pair.
pub trait Compression: Send + Sync + 'static {
    fn compress(&self, data: &[u8]) -> Result<Bytes, CompressionError>;

    /// Decompress `data`, failing once the output passes `max_bytes`
    /// (0 means unlimited).
    fn decompress(&self, data: &[u8], max_bytes: usize) -> Result<Bytes, CompressionError>;
}

fn read_limited(reader: impl Read, max_bytes: usize) -> Result<Bytes, CompressionError> {
    let mut out = Vec::new();
    if max_bytes == 0 {
        let mut reader = reader;
        reader
            .read_to_end(&mut out)
            .map_err(CompressionError::Decompress)?;
    } else {
        reader
            .take(max_bytes as u64 + 1)
            .read_to_end(&mut out)
            .map_err(CompressionError::Decompress)?;
        if out.len() > max_bytes {
            return Err(CompressionError::TooLarge { limit: max_bytes });
        }
    }
    Ok(Bytes::from(out))
}

/// Gzip via flate2.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompression;

impl Compression for GzipCompression {
    fn compress(&self, data: &[u8]) -> Result<Bytes, CompressionError> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).map_err(CompressionError::Compress)?;
        encoder
            .finish()
            .map(Bytes::from)
            .map_err(CompressionError::Compress)
    }

    fn decompress(&self, data: &[u8], max_bytes: usize) -> Result<Bytes, CompressionError> {
        read_limited(GzDecoder::new(data), max_bytes)
    }
}

/// Zstandard.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompression {
    level: i32,
}

impl ZstdCompression {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompression {
    fn default() -> Self {
        Self::new(DEFAULT_ZSTD_LEVEL)
    }
}

impl Compression for ZstdCompression {
    fn compress(&self, data: &[u8]) -> Result<Bytes, CompressionError> {
        zstd::encode_all(data, self.level)
            .map(Bytes::from)
            .map_err(CompressionError::Compress)
    }

    fn decompress(&self, data: &[u8], max_bytes: usize) -> Result<Bytes, CompressionError> {
        let decoder = zstd::stream::read::Decoder::new(data).map_err(CompressionError::Decompress)?;
        read_limited(decoder, max_bytes)
    }
}

/// Read-only registry of compressors, keyed by name.
#[derive(Clone, Default)]
pub struct Compressors {
    by_name: HashMap<String, Arc<dyn Compression>>,
    names: Vec<String>,
}

impl Compressors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `compression` under `name`. Registering `identity` or an
    /// empty name is a no-op.
    pub fn register(&mut self, name: impl Into<String>, compression: Arc<dyn Compression>) {
        let name = name.into();
        if name.is_empty() || name == COMPRESSION_IDENTITY {
            return;
        }
        if !self.by_name.contains_key(&name) {
            self.names.push(name.clone());
        }
        self.by_name.insert(name, compression);
    }

    /// Look up a compressor; `identity` and unknown names yield `None`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Compression>> {
        self.by_name.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Value for `grpc-accept-encoding`.
    pub fn comma_separated_names(&self) -> String {
        self.names.join(",")
    }

    /// Pick request and response compression names for a handler.
    ///
    /// The request's own encoding wins; when it is identity, the first
    /// supported entry of the client's accept list is used for the response.
    /// An unsupported request encoding is an Unimplemented error.
    pub fn negotiate(
        &self,
        request_encoding: Option<&str>,
        accept_encoding: Option<&str>,
    ) -> Result<(String, String), Error> {
        let request = match request_encoding.map(str::trim) {
            None | Some("") | Some(COMPRESSION_IDENTITY) => COMPRESSION_IDENTITY.to_string(),
            Some(name) if self.contains(name) => name.to_string(),
            Some(name) => {
                return Err(Error::new(
                    Code::Unimplemented,
                    format!(
                        "unknown compression {name:?}: supported encodings are {}",
                        self.comma_separated_names()
                    ),
                ));
            }
        };
        if request != COMPRESSION_IDENTITY {
            return Ok((request.clone(), request));
        }
        let response = accept_encoding
            .into_iter()
            .flat_map(|accept| accept.split(','))
            .map(str::trim)
            .find(|name| self.contains(name))
            .unwrap_or(COMPRESSION_IDENTITY)
            .to_string();
        Ok((request, response))
    }
}

impl fmt::Debug for Compressors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compressors").field("names", &self.names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Compressors {
        let mut compressors = Compressors::new();
        compressors.register(COMPRESSION_GZIP, Arc::new(GzipCompression));
        compressors.register(COMPRESSION_ZSTD, Arc::new(ZstdCompression::default()));
        compressors
    }

    #[test]
    fn test_gzip_round_trip() {
        let data = b"hello hello hello hello hello".repeat(20);
        let compressed = GzipCompression.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        let restored = GzipCompression.decompress(&compressed, 0).unwrap();
        assert_eq!(restored.as_ref(), data.as_slice());
    }

    #[test]
    fn test_zstd_round_trip() {
        let zstd = ZstdCompression::default();
        let data = vec![7u8; 4096];
        let compressed = zstd.compress(&data).unwrap();
        assert_eq!(zstd.decompress(&compressed, 0).unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn test_decompress_limit() {
        let data = vec![0u8; 10_000];
        let compressed = GzipCompression.compress(&data).unwrap();
        let err = GzipCompression.decompress(&compressed, 100).unwrap_err();
        assert!(matches!(err, CompressionError::TooLarge { limit: 100 }));
        assert_eq!(Error::from(err).code(), Code::ResourceExhausted);
        assert!(GzipCompression.decompress(&compressed, 10_000).is_ok());
    }

    #[test]
    fn test_decompress_garbage() {
        let err = GzipCompression.decompress(b"not gzip", 0).unwrap_err();
        assert_eq!(Error::from(err).code(), Code::InvalidArgument);
    }

    #[test]
    fn test_registry_names() {
        let mut compressors = registry();
        compressors.register(COMPRESSION_IDENTITY, Arc::new(GzipCompression));
        assert_eq!(compressors.comma_separated_names(), "gzip,zstd");
        assert!(compressors.get(COMPRESSION_IDENTITY).is_none());
    }

    #[test]
    fn test_negotiate() {
        let compressors = registry();
        assert_eq!(
            compressors.negotiate(None, None).unwrap(),
            ("identity".to_string(), "identity".to_string())
        );
        assert_eq!(
            compressors.negotiate(Some("zstd"), Some("gzip")).unwrap(),
            ("zstd".to_string(), "zstd".to_string())
        );
        assert_eq!(
            compressors.negotiate(Some("identity"), Some("br, gzip")).unwrap(),
            ("identity".to_string(), "gzip".to_string())
        );
        let err = compressors.negotiate(Some("br"), None).unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
        assert!(err.message().contains("gzip,zstd"));
    }
}
