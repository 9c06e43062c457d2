//! Deterministic gzip used for compressed frame payloads.
//!
//! The server expects a plain gzip member. The header mtime is pinned to zero
//! so that the same payload always compresses to the same bytes.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};

use crate::error::{ProtocolError, Result};

/// Compression level used for outgoing payloads.
pub const GZIP_LEVEL: u32 = 6;

/// Largest payload a compressed frame may inflate to.
pub const MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

/// Gzip-compress `data` with a zeroed mtime.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::with_capacity(data.len() / 2 + 32), Compression::new(GZIP_LEVEL));
    encoder
        .write_all(data)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::Compression(e.to_string()))
}

/// Decompress a single gzip member of at most [`MAX_DECOMPRESSED_SIZE`] bytes.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    decompress_limited(data, MAX_DECOMPRESSED_SIZE)
}

/// Decompress a single gzip member, failing with
/// [`ProtocolError::FrameTooLarge`] once the output passes `limit` bytes.
pub fn decompress_limited(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut decoder = GzDecoder::new(data).take(cap);
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Decompression(e.to_string()))?;
    if out.len() > limit {
        return Err(ProtocolError::FrameTooLarge {
            size: out.len(),
            max: limit,
        });
    }
    Ok(out)
}
