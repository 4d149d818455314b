//! GGUF header checks
//!
//! Rejects files that are obviously not llama.cpp models before the engine
//! sees them.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("Failed to open model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be a GGUF model ({0} bytes)")]
    Truncated(usize),
}

/// Fixed-size header at the start of every GGUF file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Parses a GGUF header from the start of `reader`.
pub fn read_header<R: Read>(reader: &mut R) -> Result<GgufHeader, GgufError> {
    let mut raw = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut raw[filled..])? {
            0 => return Err(GgufError::Truncated(filled)),
            n => filled += n,
        }
    }

    let u32_at = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
    let u64_at = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw[at..at + 8]);
        u64::from_le_bytes(bytes)
    };

    let magic = u32_at(0);
    if magic != GGUF_MAGIC {
        return Err(GgufError::InvalidMagic(magic));
    }

    let version = u32_at(4);
    if !(2..=3).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }

    Ok(GgufHeader {
        version,
        tensor_count: u64_at(8),
        metadata_kv_count: u64_at(16),
    })
}

/// Opens `path` and validates its GGUF header.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, GgufError> {
    let mut reader = BufReader::new(File::open(path)?);
    read_header(&mut reader)
}
