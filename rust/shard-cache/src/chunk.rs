// rust/shard-cache/src/chunk.rs

//! Chunk payload files.
//!
//! The processor hands back an opaque payload per chunk. It is stored as:
//! ```text
//! +----------------------+
//! | Header length (u32)  |  <- little endian
//! +----------------------+
//! | Header (bincode)     |  <- ChunkHeader
//! +----------------------+
//! | Compressed payload   |  <- compressed according to header
//! +----------------------+
//! ```
//! The header carries an XXHash64 checksum of the uncompressed payload.

use std::hash::Hasher;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::config::ChunkConfig;
use crate::error::{CacheError, Result};
use crate::metadata::ChunkMetadata;
use crate::storage::{temp_path, StorageBackend};

/// Header of a chunk file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// Magic bytes identifying a chunk file ("SHCK")
    pub magic: [u8; 4],
    /// Format version number
    pub version: u32,
    /// Compression algorithm used ("none", "lz4", or "zstd")
    pub compression: String,
    /// Size of the payload before compression
    pub uncompressed_size: u64,
    /// XXHash64 checksum of the uncompressed payload
    pub checksum: u64,
}

impl ChunkHeader {
    pub const MAGIC: [u8; 4] = *b"SHCK";
    pub const VERSION: u32 = 1;

    pub fn new(compression: String, uncompressed_size: u64, checksum: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            compression,
            uncompressed_size,
            checksum,
        }
    }

    pub fn validate_magic(&self) -> bool {
        self.magic == Self::MAGIC
    }

    pub fn validate_version(&self) -> bool {
        self.version == Self::VERSION
    }
}

/// Encodes and decodes chunk files.
#[derive(Debug, Clone)]
pub struct ChunkCodec {
    compression: String,
    compression_level: i32,
    verify_checksums: bool,
}

impl ChunkCodec {
    pub fn new(config: &ChunkConfig) -> Self {
        Self {
            compression: config.compression.clone(),
            compression_level: config.compression_level,
            verify_checksums: config.verify_checksums,
        }
    }

    /// Frames and compresses `payload` into chunk file bytes.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let checksum = checksum(payload);
        let compressed = self.compress(payload)?;
        let header = ChunkHeader::new(self.compression.clone(), payload.len() as u64, checksum);

        let header_bytes = bincode::serialize(&header)
            .map_err(|e| CacheError::chunk_format(format!("failed to serialize header: {e}")))?;

        let header_len = header_bytes.len() as u32;
        let mut data = Vec::with_capacity(4 + header_bytes.len() + compressed.len());
        data.extend_from_slice(&header_len.to_le_bytes());
        data.extend_from_slice(&header_bytes);
        data.extend_from_slice(&compressed);
        Ok(data)
    }

    /// Parses the header of chunk file bytes.
    ///
    /// Returns the header and the offset at which the payload starts.
    pub fn read_header(data: &[u8]) -> Result<(ChunkHeader, usize)> {
        let len_bytes: [u8; 4] = data
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CacheError::chunk_format("chunk file too small"))?;
        let header_len = u32::from_le_bytes(len_bytes) as usize;

        let header_bytes = data
            .get(4..4 + header_len)
            .ok_or_else(|| CacheError::chunk_format("chunk file truncated: header incomplete"))?;

        let header: ChunkHeader = bincode::deserialize(header_bytes)
            .map_err(|e| CacheError::chunk_format(format!("failed to deserialize header: {e}")))?;

        if !header.validate_magic() {
            return Err(CacheError::chunk_format(format!(
                "invalid magic bytes: expected {:?}, got {:?}",
                ChunkHeader::MAGIC,
                header.magic
            )));
        }
        if !header.validate_version() {
            return Err(CacheError::chunk_format(format!(
                "unsupported version: expected {}, got {}",
                ChunkHeader::VERSION,
                header.version
            )));
        }

        Ok((header, 4 + header_len))
    }

    /// Decodes chunk file bytes back into the payload.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let (header, offset) = Self::read_header(data)?;
        let payload = decompress(&data[offset..], &header.compression)?;

        if payload.len() as u64 != header.uncompressed_size {
            return Err(CacheError::chunk_format(format!(
                "size mismatch: expected {}, got {}",
                header.uncompressed_size,
                payload.len()
            )));
        }

        if self.verify_checksums {
            let computed = checksum(&payload);
            if computed != header.checksum {
                return Err(CacheError::chunk_format(format!(
                    "checksum mismatch: expected {}, got {}",
                    header.checksum, computed
                )));
            }
        }

        Ok(payload)
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.compression.as_str() {
            "none" => Ok(data.to_vec()),
            "lz4" => Ok(lz4_flex::compress_prepend_size(data)),
            "zstd" => zstd::encode_all(data, self.compression_level)
                .map_err(|e| CacheError::chunk_format(format!("zstd compression failed: {e}"))),
            other => Err(CacheError::chunk_format(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }
}

fn decompress(data: &[u8], compression: &str) -> Result<Vec<u8>> {
    match compression {
        "none" => Ok(data.to_vec()),
        "lz4" => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CacheError::chunk_format(format!("lz4 decompression failed: {e}"))),
        "zstd" => zstd::decode_all(data)
            .map_err(|e| CacheError::chunk_format(format!("zstd decompression failed: {e}"))),
        other => Err(CacheError::chunk_format(format!(
            "unknown compression algorithm: {other}"
        ))),
    }
}

fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// Reads and writes chunk files through a storage backend.
#[derive(Clone)]
pub struct ChunkStore {
    storage: Arc<dyn StorageBackend>,
    codec: ChunkCodec,
}

impl ChunkStore {
    pub fn new(storage: Arc<dyn StorageBackend>, codec: ChunkCodec) -> Self {
        Self { storage, codec }
    }

    pub fn codec(&self) -> &ChunkCodec {
        &self.codec
    }

    /// Stores already-encoded chunk file bytes for `chunk`.
    ///
    /// Chunk files are written once, under a temporary name first, so a
    /// crash never leaves a truncated file under the final name.
    pub async fn write_encoded(&self, chunk: &ChunkMetadata, data: &[u8]) -> Result<()> {
        let path = chunk.file_path();
        let tmp = temp_path(&path);
        self.storage.write(&tmp, data).await?;
        self.storage.rename(&tmp, &path).await
    }

    /// Reads and decodes the payload of `chunk`.
    pub async fn read(&self, chunk: &ChunkMetadata) -> Result<Bytes> {
        let path = chunk.file_path();
        let data = self.storage.read(&path).await?;

        let codec = self.codec.clone();
        let payload = tokio::task::spawn_blocking(move || codec.decode(&data))
            .await
            .map_err(|e| {
                CacheError::invalid_state(format!("chunk decode task failed: {e}"))
            })?
            .map_err(|e| annotate(&path, e))?;

        Ok(Bytes::from(payload))
    }
}

fn annotate(path: &Path, error: CacheError) -> CacheError {
    match error {
        CacheError::ChunkFormat { message } => {
            CacheError::chunk_format(format!("{}: {message}", path.display()))
        }
        other => other,
    }
}
