//! Payload compression for stored model definitions

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use relevance_core::{Error, Result};

/// Default zlib compression level
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// zlib codec applied to every model node payload
#[derive(Debug, Clone, Copy)]
pub struct ModelCodec {
    level: Compression,
}

impl Default for ModelCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL)
    }
}

impl ModelCodec {
    /// Create a codec with the given level, clamped to 0-9
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    /// Compress a UTF-8 definition
    pub fn compress(&self, text: &str) -> Result<Bytes> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(text.len() / 2 + 16), self.level);
        encoder.write_all(text.as_bytes())?;
        Ok(Bytes::from(encoder.finish()?))
    }

    /// Decompress a payload back into the definition text
    pub fn decompress(&self, bytes: &[u8]) -> Result<String> {
        let mut decoder = ZlibDecoder::new(bytes);
        let mut raw = Vec::with_capacity(bytes.len() * 4);
        decoder.read_to_end(&mut raw).map_err(|e| Error::Decode {
            message: format!("can not inflate model payload: {}", e),
        })?;

        String::from_utf8(raw).map_err(|e| Error::Decode {
            message: format!("model payload is not UTF-8: {}", e),
        })
    }
}
