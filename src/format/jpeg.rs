//! JPEG header reader.
//!
//! Walks marker segments from SOI until the first start-of-frame marker,
//! which carries sample precision, dimensions and component count. Each
//! segment costs one small range read; entropy-coded data is never touched.

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};

use crate::error::{DecodeError, ImageError};
use crate::io::{read_u16_be, RangeReader};
use crate::raster::PixelLayout;

use super::decoder::{decode_with_image, invalid_header, read_required, FormatDecoder, HeaderInfo};

const FORMAT: &str = "jpeg";

// =============================================================================
// JPEG Markers
// =============================================================================

/// Start Of Image marker
const SOI: [u8; 2] = [0xFF, 0xD8];

/// Define Huffman Table (shares the SOFn range but is not a frame)
const DHT: u8 = 0xC4;

/// Define Arithmetic Coding conditioning (likewise not a frame)
const DAC: u8 = 0xCC;

/// JPG extension marker, reserved
const JPG: u8 = 0xC8;

/// End Of Image marker
const EOI: u8 = 0xD9;

/// Start Of Scan marker
const SOS: u8 = 0xDA;

/// Upper bound on segments inspected before SOF
const MAX_SEGMENTS: usize = 256;

/// SOFn payload read by the header reader: precision(1) + height(2) + width(2) + components(1)
const FRAME_HEADER_LEN: usize = 6;

/// Is `marker` a start-of-frame marker (SOF0..SOF15 minus DHT, JPG, DAC)?
fn is_start_of_frame(marker: u8) -> bool {
    (0xC0..=0xCF).contains(&marker) && !matches!(marker, DHT | JPG | DAC)
}

/// Markers with no length field.
fn is_standalone(marker: u8) -> bool {
    matches!(marker, 0x01 | 0xD0..=0xD7)
}

/// Decoder for baseline and progressive JPEG streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegDecoder;

#[async_trait]
impl FormatDecoder for JpegDecoder {
    fn name(&self) -> &'static str {
        FORMAT
    }

    fn signature_len(&self) -> usize {
        3
    }

    fn signature(&self) -> &'static str {
        "FF D8 FF"
    }

    fn matches_signature(&self, leading: &[u8]) -> bool {
        leading.starts_with(&SOI) && leading.get(2) == Some(&0xFF)
    }

    async fn read_header(&self, reader: &dyn RangeReader) -> Result<HeaderInfo, ImageError> {
        let mut offset = SOI.len() as u64;

        for _ in 0..MAX_SEGMENTS {
            let head = read_required(reader, FORMAT, offset, 2).await?;
            if head[0] != 0xFF {
                return Err(invalid_header(
                    FORMAT,
                    format!("expected marker at offset {offset}, found {:#04x}", head[0]),
                ));
            }

            let marker = head[1];
            if marker == 0xFF {
                // Fill byte before the real marker
                offset += 1;
                continue;
            }
            if is_standalone(marker) {
                offset += 2;
                continue;
            }
            if marker == SOS || marker == EOI {
                return Err(invalid_header(FORMAT, "no frame header before image data"));
            }

            let length = read_u16_be(&read_required(reader, FORMAT, offset + 2, 2).await?) as u64;
            if length < 2 {
                return Err(invalid_header(
                    FORMAT,
                    format!("segment length {length} at offset {offset}"),
                ));
            }

            if is_start_of_frame(marker) {
                let frame = read_required(reader, FORMAT, offset + 4, FRAME_HEADER_LEN).await?;
                return frame_header(&frame);
            }

            offset += 2 + length;
        }

        Err(invalid_header(
            FORMAT,
            format!("no frame header in the first {MAX_SEGMENTS} segments"),
        ))
    }

    async fn decode_raster(
        &self,
        reader: &dyn RangeReader,
        _header: &HeaderInfo,
    ) -> Result<DynamicImage, ImageError> {
        decode_with_image(reader, FORMAT, ImageFormat::Jpeg).await
    }
}

fn frame_header(frame: &[u8]) -> Result<HeaderInfo, ImageError> {
    let precision = frame[0];
    let height = read_u16_be(&frame[1..3]) as u32;
    let width = read_u16_be(&frame[3..5]) as u32;
    let components = frame[5];

    if !matches!(precision, 8 | 12 | 16) {
        return Err(invalid_header(
            FORMAT,
            format!("sample precision {precision}"),
        ));
    }

    // Height 0 defers to a DNL marker after the first scan; not supported
    if height == 0 {
        return Err(DecodeError::ZeroDimensions {
            format: FORMAT,
            width,
            height,
        }
        .into());
    }

    let layout = match components {
        1 => PixelLayout::Gray8,
        3 | 4 => PixelLayout::Rgb8,
        other => {
            return Err(invalid_header(
                FORMAT,
                format!("{other} color components"),
            ))
        }
    };

    Ok(HeaderInfo::new(width, height, layout))
}
