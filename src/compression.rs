//! Snapshot payload compression
//!
//! Shard snapshots are written as a small header followed by the compressed
//! payload. The header records the algorithm so a snapshot stays readable
//! after the configured algorithm changes.
//!
//! ```text
//! magic(4) | version(u16 LE) | algorithm tag(u8) | payload
//! ```

use std::io::{Read, Write};

use lz4::{Decoder as Lz4Decoder, EncoderBuilder as Lz4EncoderBuilder};
use zstd::{Decoder as ZstdDecoder, Encoder as ZstdEncoder};

use crate::config::CompressionAlgorithm;
use crate::error::{Error, Result};

const SNAPSHOT_MAGIC: &[u8; 4] = b"TSNP";
const SNAPSHOT_VERSION: u16 = 1;
const HEADER_SIZE: usize = 4 + 2 + 1;

/// Encodes and decodes snapshot payloads
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCodec {
    algorithm: CompressionAlgorithm,
    level: i32,
}

impl SnapshotCodec {
    /// Create a codec writing with the given algorithm and level
    pub fn new(algorithm: CompressionAlgorithm, level: i32) -> Self {
        Self {
            algorithm,
            level: level.clamp(0, 9),
        }
    }

    /// Algorithm used for encoding
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Compress `data` and prepend the snapshot header
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let payload = compress(data, self.algorithm, self.level)?;

        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.push(self.algorithm.tag());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Check the header and decompress the payload, whatever algorithm it
    /// was written with
    pub fn decode(data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < HEADER_SIZE {
            return Err(Error::corruption("snapshot shorter than its header"));
        }
        if &data[..4] != SNAPSHOT_MAGIC {
            return Err(Error::corruption("bad snapshot magic"));
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != SNAPSHOT_VERSION {
            return Err(Error::corruption(format!("unsupported snapshot version {}", version)));
        }

        let algorithm = CompressionAlgorithm::from_tag(data[6])?;
        decompress(&data[HEADER_SIZE..], algorithm)
    }
}

/// Compress data with the specified algorithm and level
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm, level: i32) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => {
            let mut encoder = Lz4EncoderBuilder::new()
                .level(level.clamp(0, 9) as u32)
                .build(Vec::new())
                .map_err(|e| Error::compression(format!("lz4 encoder: {}", e)))?;
            encoder
                .write_all(data)
                .map_err(|e| Error::compression(format!("lz4 write: {}", e)))?;

            let (compressed, result) = encoder.finish();
            result.map_err(|e| Error::compression(format!("lz4 finish: {}", e)))?;
            Ok(compressed)
        }
        CompressionAlgorithm::Zstd => {
            let mut compressed = Vec::new();
            let mut encoder = ZstdEncoder::new(&mut compressed, level.clamp(1, 22))
                .map_err(|e| Error::compression(format!("zstd encoder: {}", e)))?;
            encoder
                .write_all(data)
                .map_err(|e| Error::compression(format!("zstd write: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| Error::compression(format!("zstd finish: {}", e)))?;
            Ok(compressed)
        }
    }
}

/// Decompress data with the specified algorithm
pub fn decompress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    match algorithm {
        CompressionAlgorithm::None => decompressed.extend_from_slice(data),
        CompressionAlgorithm::Lz4 => {
            let mut decoder = Lz4Decoder::new(data)
                .map_err(|e| Error::compression(format!("lz4 decoder: {}", e)))?;
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| Error::compression(format!("lz4 read: {}", e)))?;
        }
        CompressionAlgorithm::Zstd => {
            let mut decoder = ZstdDecoder::new(data)
                .map_err(|e| Error::compression(format!("zstd decoder: {}", e)))?;
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| Error::compression(format!("zstd read: {}", e)))?;
        }
    }
    Ok(decompressed)
}
