//! PNG header reader.
//!
//! The IHDR chunk sits at a fixed offset right after the signature, so
//! dimensions and color type come from a single 25-byte read. Transparency
//! can only be learned from a `tRNS` chunk, which must precede the first
//! `IDAT`; the reader walks chunk headers up to that point.

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};

use crate::error::ImageError;
use crate::io::{read_u32_be, RangeReader};
use crate::raster::PixelLayout;

use super::decoder::{decode_with_image, invalid_header, read_required, FormatDecoder, HeaderInfo};

const FORMAT: &str = "png";

/// PNG file signature
const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Offset of the IHDR chunk (length field)
const IHDR_OFFSET: u64 = 8;

/// IHDR chunk: length(4) + type(4) + data(13)
const IHDR_READ_LEN: usize = 21;

/// Chunk header: length(4) + type(4)
const CHUNK_HEADER_LEN: usize = 8;

/// Chunks inspected before giving up on finding IDAT
const MAX_ANCILLARY_CHUNKS: usize = 64;

/// Decoder for PNG streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngDecoder;

#[async_trait]
impl FormatDecoder for PngDecoder {
    fn name(&self) -> &'static str {
        FORMAT
    }

    fn signature_len(&self) -> usize {
        SIGNATURE.len()
    }

    fn signature(&self) -> &'static str {
        "\\x89PNG\\r\\n\\x1a\\n"
    }

    fn matches_signature(&self, leading: &[u8]) -> bool {
        leading.starts_with(&SIGNATURE)
    }

    async fn read_header(&self, reader: &dyn RangeReader) -> Result<HeaderInfo, ImageError> {
        let ihdr = read_required(reader, FORMAT, IHDR_OFFSET, IHDR_READ_LEN).await?;

        if read_u32_be(&ihdr[0..4]) != 13 || &ihdr[4..8] != b"IHDR" {
            return Err(invalid_header(FORMAT, "first chunk is not IHDR"));
        }

        let width = read_u32_be(&ihdr[8..12]);
        let height = read_u32_be(&ihdr[12..16]);
        let bit_depth = ihdr[16];
        let color_type = ihdr[17];

        let valid_depth = match color_type {
            0 => matches!(bit_depth, 1 | 2 | 4 | 8 | 16),
            3 => matches!(bit_depth, 1 | 2 | 4 | 8),
            2 | 4 | 6 => matches!(bit_depth, 8 | 16),
            _ => {
                return Err(invalid_header(
                    FORMAT,
                    format!("unknown color type {color_type}"),
                ))
            }
        };
        if !valid_depth {
            return Err(invalid_header(
                FORMAT,
                format!("bit depth {bit_depth} not allowed for color type {color_type}"),
            ));
        }

        let transparent = match color_type {
            0 | 2 | 3 => has_transparency_chunk(reader).await?,
            _ => false,
        };

        let wide = bit_depth == 16;
        let layout = match (color_type, transparent, wide) {
            (0, false, false) => PixelLayout::Gray8,
            (0, false, true) => PixelLayout::Gray16,
            (0, true, false) | (4, _, false) => PixelLayout::GrayAlpha8,
            (0, true, true) | (4, _, true) => PixelLayout::GrayAlpha16,
            (2, false, false) | (3, false, _) => PixelLayout::Rgb8,
            (2, false, true) => PixelLayout::Rgb16,
            (2, true, false) | (3, true, _) | (6, _, false) => PixelLayout::Rgba8,
            _ => PixelLayout::Rgba16,
        };

        Ok(HeaderInfo::new(width, height, layout))
    }

    async fn decode_raster(
        &self,
        reader: &dyn RangeReader,
        _header: &HeaderInfo,
    ) -> Result<DynamicImage, ImageError> {
        decode_with_image(reader, FORMAT, ImageFormat::Png).await
    }
}

/// Walk chunk headers after IHDR looking for `tRNS` before the image data.
async fn has_transparency_chunk(reader: &dyn RangeReader) -> Result<bool, ImageError> {
    let size = reader.size();
    let mut offset = IHDR_OFFSET + IHDR_READ_LEN as u64 + 4;

    for _ in 0..MAX_ANCILLARY_CHUNKS {
        if offset + CHUNK_HEADER_LEN as u64 > size {
            // Missing IDAT surfaces when the payload is decoded
            return Ok(false);
        }
        let header = reader.read_exact_at(offset, CHUNK_HEADER_LEN).await?;
        match &header[4..8] {
            b"tRNS" => return Ok(true),
            b"IDAT" | b"IEND" => return Ok(false),
            _ => {}
        }
        let length = read_u32_be(&header[0..4]) as u64;
        offset += CHUNK_HEADER_LEN as u64 + length + 4;
    }

    Ok(false)
}
