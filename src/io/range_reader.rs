use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::IoError;

/// Trait for random-access reads from an encoded image source.
///
/// Reads are positional: an implementation never exposes a shared cursor, so
/// header reads and pixel decodes can fetch bytes out of order without
/// disturbing one another. Implementations must be thread-safe.
#[async_trait]
pub trait RangeReader: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Returns an error if the range is out of bounds or if the read fails.
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError>;

    /// Get the total size of the resource in bytes.
    fn size(&self) -> u64;

    /// Get a unique identifier for this resource (for logging).
    ///
    /// For S3 this is `s3://bucket/key`, for files the path.
    fn identifier(&self) -> &str;
}

/// A stream source shared between the caller and any images built from it.
pub type SharedSource = Arc<dyn RangeReader>;

/// Read up to `len` bytes at `offset`, clamped to the end of the resource.
///
/// Header readers use this for text headers whose length is not known up front.
pub async fn read_at_most<R: RangeReader + ?Sized>(
    reader: &R,
    offset: u64,
    len: usize,
) -> Result<Bytes, IoError> {
    let available = reader.size().saturating_sub(offset);
    let len = (len as u64).min(available) as usize;
    reader.read_exact_at(offset, len).await
}

// =============================================================================
// Endian Helpers
// =============================================================================
//
// Header readers read fixed-width integers in both byte orders: BMP is
// little-endian, PNG and JPEG are big-endian, TIFF declares its own.

/// Read a little-endian u16 from the first two bytes of `bytes`.
#[inline]
pub fn read_u16_le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Read a big-endian u16 from the first two bytes of `bytes`.
#[inline]
pub fn read_u16_be(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Read a little-endian u32 from the first four bytes of `bytes`.
#[inline]
pub fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Read a big-endian u32 from the first four bytes of `bytes`.
#[inline]
pub fn read_u32_be(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Read a little-endian i32 from the first four bytes of `bytes`.
#[inline]
pub fn read_i32_le(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Read a little-endian u64 from the first eight bytes of `bytes`.
#[inline]
pub fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Read a big-endian u64 from the first eight bytes of `bytes`.
#[inline]
pub fn read_u64_be(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}
