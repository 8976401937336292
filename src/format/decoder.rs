//! The per-format decoder contract.
//!
//! A decoder does two things: a cheap header read that runs during
//! construction, and a full pixel decode that runs only when a tile is first
//! requested. Both read through [`RangeReader`] so the header read can stop after a
//! few dozen bytes.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, ImageReader};

use crate::error::{DecodeError, ImageError, IoError};
use crate::io::RangeReader;
use crate::raster::PixelLayout;

/// Everything a header read learns about a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderInfo {
    pub width: u32,
    pub height: u32,

    /// Layout the decoded payload is expected to have
    pub layout: PixelLayout,

    /// Which image of a multi-image stream was read: a TIFF directory or
    /// FlashPix resolution, 0 for single-image formats. `decode_raster`
    /// decodes this same image.
    pub subimage: u32,
}

impl HeaderInfo {
    /// Header of the first (or only) image in a stream.
    pub const fn new(width: u32, height: u32, layout: PixelLayout) -> Self {
        Self {
            width,
            height,
            layout,
            subimage: 0,
        }
    }
}

/// Decoding backend for one encoded image format.
#[async_trait]
pub trait FormatDecoder: Send + Sync {
    /// Format name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Number of leading bytes [`matches_signature`](Self::matches_signature)
    /// needs.
    fn signature_len(&self) -> usize;

    /// Human-readable description of the expected signature.
    fn signature(&self) -> &'static str;

    /// Check the leading bytes of a stream.
    ///
    /// `leading` holds at least `signature_len()` bytes.
    fn matches_signature(&self, leading: &[u8]) -> bool;

    /// Parse dimensions and pixel layout with bounded reads.
    ///
    /// Must not read the pixel payload.
    async fn read_header(&self, reader: &dyn RangeReader) -> Result<HeaderInfo, ImageError>;

    /// Probe one image of a multi-image stream: a TIFF directory or a
    /// FlashPix resolution.
    ///
    /// Single-image formats accept only index 0.
    async fn read_subimage_header(
        &self,
        reader: &dyn RangeReader,
        index: u32,
    ) -> Result<HeaderInfo, ImageError> {
        if index == 0 {
            return self.read_header(reader).await;
        }
        Err(DecodeError::Unsupported {
            format: self.name(),
            feature: format!("subimage {index}"),
        }
        .into())
    }

    /// Decode the full raster.
    async fn decode_raster(
        &self,
        reader: &dyn RangeReader,
        header: &HeaderInfo,
    ) -> Result<DynamicImage, ImageError>;
}

/// Read a header structure the format requires.
///
/// A stream too short to hold it is a [`DecodeError::Truncated`] rather than
/// an I/O error.
pub(crate) async fn read_required(
    reader: &dyn RangeReader,
    format: &'static str,
    offset: u64,
    len: usize,
) -> Result<Bytes, ImageError> {
    let size = reader.size();
    let end = offset.saturating_add(len as u64);
    if end > size {
        return Err(DecodeError::Truncated {
            format,
            required: end,
            actual: size,
        }
        .into());
    }
    Ok(reader.read_exact_at(offset, len).await?)
}

/// Shorthand for [`DecodeError::InvalidHeader`].
pub(crate) fn invalid_header(format: &'static str, message: impl Into<String>) -> ImageError {
    DecodeError::InvalidHeader {
        format,
        message: message.into(),
    }
    .into()
}

/// Read the whole stream and decode it with the `image` crate.
pub(crate) async fn decode_with_image(
    reader: &dyn RangeReader,
    format: &'static str,
    image_format: ImageFormat,
) -> Result<DynamicImage, ImageError> {
    let encoded = read_whole_stream(reader, format).await?;

    run_blocking(format, move || {
        ImageReader::with_format(Cursor::new(encoded), image_format)
            .decode()
            .map_err(|err| payload_error(format, err))
    })
    .await
}

/// Read every byte of the stream, mapping a short stream to truncation.
pub(crate) async fn read_whole_stream(
    reader: &dyn RangeReader,
    format: &'static str,
) -> Result<Bytes, ImageError> {
    let size = reader.size();
    let len = usize::try_from(size).map_err(|_| DecodeError::Unsupported {
        format,
        feature: format!("stream of {size} bytes does not fit in memory"),
    })?;

    let encoded = reader.read_exact_at(0, len).await.map_err(|err| match err {
        IoError::RangeOutOfBounds { offset, requested, size } => {
            ImageError::Decode(DecodeError::Truncated {
                format,
                required: offset + requested,
                actual: size,
            })
        }
        other => ImageError::Input(other),
    })?;

    Ok(encoded)
}

/// Run CPU-bound pixel work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(format: &'static str, work: F) -> Result<T, ImageError>
where
    F: FnOnce() -> Result<T, ImageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| DecodeError::Payload {
            format,
            message: format!("decode task failed: {err}"),
        })?
}

pub(crate) fn payload_error(format: &'static str, err: image::ImageError) -> ImageError {
    let message = match err {
        image::ImageError::IoError(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            "unexpected end of stream".to_string()
        }
        other => other.to_string(),
    };
    DecodeError::Payload { format, message }.into()
}
