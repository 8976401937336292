//! BMP header reader.
//!
//! Reads the 14-byte file header and the fixed part of the DIB header. Both
//! the OS/2 core header (16-bit dimensions) and the Windows family
//! (BITMAPINFOHEADER and its V4/V5 extensions) are recognised.

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};

use crate::error::ImageError;
use crate::io::{read_i32_le, read_u16_le, read_u32_le, RangeReader};
use crate::raster::PixelLayout;

use super::decoder::{decode_with_image, invalid_header, read_required, FormatDecoder, HeaderInfo};

const FORMAT: &str = "bmp";

const FILE_HEADER_LEN: u64 = 14;

/// BITMAPCOREHEADER size
const CORE_HEADER_LEN: u32 = 12;

/// Fixed part of every larger DIB header that the header reader reads
const INFO_HEADER_LEN: u32 = 40;

/// DIB header sizes in the wild
const KNOWN_DIB_SIZES: [u32; 8] = [12, 16, 40, 52, 56, 64, 108, 124];

/// Decoder for Windows and OS/2 bitmaps.
#[derive(Debug, Clone, Copy, Default)]
pub struct BmpDecoder;

#[async_trait]
impl FormatDecoder for BmpDecoder {
    fn name(&self) -> &'static str {
        FORMAT
    }

    fn signature_len(&self) -> usize {
        2
    }

    fn signature(&self) -> &'static str {
        "BM"
    }

    fn matches_signature(&self, leading: &[u8]) -> bool {
        leading.starts_with(b"BM")
    }

    async fn read_header(&self, reader: &dyn RangeReader) -> Result<HeaderInfo, ImageError> {
        let head = read_required(reader, FORMAT, 0, FILE_HEADER_LEN as usize + 4).await?;

        let pixel_offset = read_u32_le(&head[10..14]) as u64;
        let dib_size = read_u32_le(&head[14..18]);
        if !KNOWN_DIB_SIZES.contains(&dib_size) {
            return Err(invalid_header(
                FORMAT,
                format!("unknown DIB header size {dib_size}"),
            ));
        }

        let dib_len = dib_size.min(INFO_HEADER_LEN) as usize;
        let dib = read_required(reader, FORMAT, FILE_HEADER_LEN, dib_len).await?;

        let (width, height, planes, bpp) = if dib_size == CORE_HEADER_LEN {
            (
                read_u16_le(&dib[4..6]) as i64,
                read_u16_le(&dib[6..8]) as i64,
                read_u16_le(&dib[8..10]),
                read_u16_le(&dib[10..12]),
            )
        } else {
            (
                read_i32_le(&dib[4..8]) as i64,
                read_i32_le(&dib[8..12]) as i64,
                read_u16_le(&dib[12..14]),
                read_u16_le(&dib[14..16]),
            )
        };

        if planes != 1 {
            return Err(invalid_header(FORMAT, format!("{planes} color planes")));
        }
        if !matches!(bpp, 1 | 2 | 4 | 8 | 16 | 24 | 32) {
            return Err(invalid_header(FORMAT, format!("{bpp} bits per pixel")));
        }
        if width < 0 {
            return Err(invalid_header(FORMAT, format!("negative width {width}")));
        }
        if pixel_offset >= reader.size() {
            return Err(invalid_header(
                FORMAT,
                format!("pixel data offset {pixel_offset} past end of stream"),
            ));
        }

        // Negative height marks a top-down bitmap
        let height = height.unsigned_abs();
        let width = u32::try_from(width).map_err(|_| invalid_header(FORMAT, "width overflow"))?;
        let height =
            u32::try_from(height).map_err(|_| invalid_header(FORMAT, "height overflow"))?;

        let layout = if bpp == 32 {
            PixelLayout::Rgba8
        } else {
            PixelLayout::Rgb8
        };

        Ok(HeaderInfo::new(width, height, layout))
    }

    async fn decode_raster(
        &self,
        reader: &dyn RangeReader,
        _header: &HeaderInfo,
    ) -> Result<DynamicImage, ImageError> {
        decode_with_image(reader, FORMAT, ImageFormat::Bmp).await
    }
}
