//! TIFF header reader.
//!
//! Parses the file header and one IFD: the first, or the directory selected
//! by index, reached by walking the `next IFD` links. Both classic TIFF
//! (32-bit offsets) and BigTIFF (64-bit offsets) are accepted. Pixel decoding
//! of the first directory is delegated to the `image` crate; later
//! directories are decoded with the `tiff` crate, which can seek between
//! them.
//!
//! # IFD entry layout
//!
//! | Variant | count field | entry | value/offset field |
//! |---------|-------------|-------|--------------------|
//! | TIFF    | u16         | 12    | 4 bytes            |
//! | BigTIFF | u64         | 20    | 8 bytes            |

use std::collections::HashSet;
use std::io::Cursor;

use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, ImageFormat};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::ColorType;

use crate::error::{DecodeError, ImageError};
use crate::io::{
    read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be, read_u64_le, RangeReader,
};
use crate::raster::PixelLayout;

use super::decoder::{
    decode_with_image, invalid_header, read_required, read_whole_stream, run_blocking,
    FormatDecoder, HeaderInfo,
};

const FORMAT: &str = "tiff";

/// Little-endian byte order marker ("II")
const BYTE_ORDER_LITTLE_ENDIAN: [u8; 2] = *b"II";

/// Big-endian byte order marker ("MM")
const BYTE_ORDER_BIG_ENDIAN: [u8; 2] = *b"MM";

const VERSION_TIFF: u16 = 42;
const VERSION_BIGTIFF: u16 = 43;

const BIGTIFF_HEADER_SIZE: usize = 16;

/// More entries than this in one IFD is treated as corruption
const MAX_IFD_ENTRIES: u64 = 4096;

/// Highest directory index a caller may select
const MAX_DIRECTORY_INDEX: u32 = 65_535;

// Tags the header reader uses
const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_PHOTOMETRIC: u16 = 262;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;

// Field types
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_LONG8: u16 = 16;

// Photometric interpretations
const PHOTOMETRIC_PALETTE: u16 = 3;
const PHOTOMETRIC_SEPARATED: u16 = 5;
const PHOTOMETRIC_YCBCR: u16 = 6;

// =============================================================================
// ByteOrder / TiffHeader
// =============================================================================

/// Byte order declared in the first two bytes of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    fn read_u16(self, bytes: &[u8]) -> u16 {
        match self {
            ByteOrder::LittleEndian => read_u16_le(bytes),
            ByteOrder::BigEndian => read_u16_be(bytes),
        }
    }

    fn read_u32(self, bytes: &[u8]) -> u32 {
        match self {
            ByteOrder::LittleEndian => read_u32_le(bytes),
            ByteOrder::BigEndian => read_u32_be(bytes),
        }
    }

    fn read_u64(self, bytes: &[u8]) -> u64 {
        match self {
            ByteOrder::LittleEndian => read_u64_le(bytes),
            ByteOrder::BigEndian => read_u64_be(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TiffHeader {
    byte_order: ByteOrder,
    is_bigtiff: bool,
    first_ifd_offset: u64,
}

impl TiffHeader {
    fn parse(bytes: &[u8], file_size: u64) -> Result<Self, ImageError> {
        let byte_order = match [bytes[0], bytes[1]] {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            other => {
                return Err(invalid_header(
                    FORMAT,
                    format!("byte order marker {other:02x?}"),
                ))
            }
        };

        let version = byte_order.read_u16(&bytes[2..4]);
        let (is_bigtiff, first_ifd_offset) = match version {
            VERSION_TIFF => (false, byte_order.read_u32(&bytes[4..8]) as u64),
            VERSION_BIGTIFF => {
                if bytes.len() < BIGTIFF_HEADER_SIZE {
                    return Err(invalid_header(FORMAT, "BigTIFF header truncated"));
                }
                let offset_size = byte_order.read_u16(&bytes[4..6]);
                if offset_size != 8 {
                    return Err(invalid_header(
                        FORMAT,
                        format!("BigTIFF offset size {offset_size}"),
                    ));
                }
                (true, byte_order.read_u64(&bytes[8..16]))
            }
            other => return Err(invalid_header(FORMAT, format!("version {other}"))),
        };

        if first_ifd_offset < 8 || first_ifd_offset >= file_size {
            return Err(invalid_header(
                FORMAT,
                format!("first IFD offset {first_ifd_offset} outside the file"),
            ));
        }

        Ok(TiffHeader {
            byte_order,
            is_bigtiff,
            first_ifd_offset,
        })
    }

    const fn count_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            2
        }
    }

    const fn entry_size(&self) -> usize {
        if self.is_bigtiff {
            20
        } else {
            12
        }
    }

    const fn value_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            4
        }
    }
}

// =============================================================================
// IFD
// =============================================================================

/// Fields of one IFD that decide dimensions and layout.
#[derive(Debug, Default)]
struct Ifd {
    width: Option<u64>,
    height: Option<u64>,
    bits_per_sample: Option<u16>,
    samples_per_pixel: Option<u16>,
    photometric: Option<u16>,
}

impl Ifd {
    fn layout(&self) -> Result<PixelLayout, ImageError> {
        let bits = self.bits_per_sample.unwrap_or(1);
        let samples = self.samples_per_pixel.unwrap_or(1);

        let layout = match self.photometric {
            Some(PHOTOMETRIC_PALETTE) => Some(PixelLayout::Rgb8),
            Some(PHOTOMETRIC_SEPARATED) => Some(PixelLayout::Rgb8),
            Some(PHOTOMETRIC_YCBCR) => PixelLayout::from_channels(3, bits),
            _ => PixelLayout::from_channels(samples, bits),
        };

        layout.ok_or_else(|| {
            invalid_header(
                FORMAT,
                format!("{samples} samples of {bits} bits per pixel"),
            )
        })
    }
}

/// Number of entries in the IFD at `offset`.
async fn read_entry_count(
    reader: &dyn RangeReader,
    header: &TiffHeader,
    offset: u64,
) -> Result<u64, ImageError> {
    let order = header.byte_order;
    let count_bytes = read_required(reader, FORMAT, offset, header.count_size()).await?;
    let count = if header.is_bigtiff {
        order.read_u64(&count_bytes)
    } else {
        order.read_u16(&count_bytes) as u64
    };

    if count == 0 || count > MAX_IFD_ENTRIES {
        return Err(invalid_header(FORMAT, format!("IFD with {count} entries")));
    }
    Ok(count)
}

/// Offset of directory `index`, following `next IFD` links from the first.
async fn locate_ifd(
    reader: &dyn RangeReader,
    header: &TiffHeader,
    index: u32,
) -> Result<u64, ImageError> {
    if index > MAX_DIRECTORY_INDEX {
        return Err(invalid_header(FORMAT, format!("directory index {index}")));
    }

    let order = header.byte_order;
    let mut offset = header.first_ifd_offset;
    let mut visited = HashSet::new();

    for current in 0..index {
        if !visited.insert(offset) {
            return Err(invalid_header(
                FORMAT,
                format!("IFD chain loops back to offset {offset}"),
            ));
        }

        let count = read_entry_count(reader, header, offset).await?;
        let link_at = offset + header.count_size() as u64 + count * header.entry_size() as u64;
        let link = read_required(reader, FORMAT, link_at, header.value_size()).await?;
        let next = if header.is_bigtiff {
            order.read_u64(&link)
        } else {
            order.read_u32(&link) as u64
        };

        if next == 0 {
            return Err(invalid_header(
                FORMAT,
                format!("directory {index} requested, stream has {}", current + 1),
            ));
        }
        if next < 8 || next >= reader.size() {
            return Err(invalid_header(
                FORMAT,
                format!("IFD offset {next} outside the file"),
            ));
        }
        offset = next;
    }

    Ok(offset)
}

async fn read_ifd(
    reader: &dyn RangeReader,
    header: &TiffHeader,
    offset: u64,
) -> Result<Ifd, ImageError> {
    let order = header.byte_order;
    let count = read_entry_count(reader, header, offset).await?;

    let entries_offset = offset + header.count_size() as u64;
    let entries = read_required(
        reader,
        FORMAT,
        entries_offset,
        count as usize * header.entry_size(),
    )
    .await?;

    let mut ifd = Ifd::default();
    for entry in entries.chunks_exact(header.entry_size()) {
        let tag = order.read_u16(&entry[0..2]);
        let field_type = order.read_u16(&entry[2..4]);
        let value = &entry[header.entry_size() - header.value_size()..];

        match tag {
            TAG_IMAGE_WIDTH => ifd.width = Some(inline_integer(order, field_type, value)?),
            TAG_IMAGE_LENGTH => ifd.height = Some(inline_integer(order, field_type, value)?),
            TAG_SAMPLES_PER_PIXEL => {
                ifd.samples_per_pixel = Some(inline_integer(order, field_type, value)? as u16)
            }
            TAG_PHOTOMETRIC => {
                ifd.photometric = Some(inline_integer(order, field_type, value)? as u16)
            }
            TAG_BITS_PER_SAMPLE => {
                // One value per sample; every sample shares a depth in practice
                let count = if header.is_bigtiff {
                    order.read_u64(&entry[4..12])
                } else {
                    order.read_u32(&entry[4..8]) as u64
                };
                let inline = count <= (header.value_size() / 2) as u64;
                let first = if inline {
                    order.read_u16(value)
                } else {
                    let offset = if header.is_bigtiff {
                        order.read_u64(value)
                    } else {
                        order.read_u32(value) as u64
                    };
                    order.read_u16(&read_required(reader, FORMAT, offset, 2).await?)
                };
                ifd.bits_per_sample = Some(first);
            }
            _ => {}
        }
    }

    Ok(ifd)
}

/// Decode a single SHORT, LONG or LONG8 stored inline in an entry.
fn inline_integer(order: ByteOrder, field_type: u16, value: &[u8]) -> Result<u64, ImageError> {
    match field_type {
        TYPE_SHORT => Ok(order.read_u16(value) as u64),
        TYPE_LONG => Ok(order.read_u32(value) as u64),
        TYPE_LONG8 if value.len() >= 8 => Ok(order.read_u64(value)),
        other => Err(invalid_header(
            FORMAT,
            format!("unexpected field type {other} for an integer tag"),
        )),
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// Decoder for TIFF and BigTIFF streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiffDecoder;

#[async_trait]
impl FormatDecoder for TiffDecoder {
    fn name(&self) -> &'static str {
        FORMAT
    }

    fn signature_len(&self) -> usize {
        4
    }

    fn signature(&self) -> &'static str {
        "II*\\0, MM\\0*, II+\\0 or MM\\0+"
    }

    fn matches_signature(&self, leading: &[u8]) -> bool {
        matches!(
            leading,
            [b'I', b'I', 42 | 43, 0, ..] | [b'M', b'M', 0, 42 | 43, ..]
        )
    }

    async fn read_header(&self, reader: &dyn RangeReader) -> Result<HeaderInfo, ImageError> {
        self.read_subimage_header(reader, 0).await
    }

    async fn read_subimage_header(
        &self,
        reader: &dyn RangeReader,
        index: u32,
    ) -> Result<HeaderInfo, ImageError> {
        let head = read_required(reader, FORMAT, 0, 8).await?;
        let head = if head[2..4].contains(&(VERSION_BIGTIFF as u8)) {
            read_required(reader, FORMAT, 0, BIGTIFF_HEADER_SIZE).await?
        } else {
            head
        };
        let header = TiffHeader::parse(&head, reader.size())?;
        let offset = locate_ifd(reader, &header, index).await?;
        let ifd = read_ifd(reader, &header, offset).await?;

        let width = ifd
            .width
            .ok_or_else(|| invalid_header(FORMAT, "missing ImageWidth"))?;
        let height = ifd
            .height
            .ok_or_else(|| invalid_header(FORMAT, "missing ImageLength"))?;
        let width = u32::try_from(width).map_err(|_| invalid_header(FORMAT, "width overflow"))?;
        let height =
            u32::try_from(height).map_err(|_| invalid_header(FORMAT, "height overflow"))?;

        // Alpha arrives as an extra sample, already counted in SamplesPerPixel
        let layout = ifd.layout()?;

        Ok(HeaderInfo {
            subimage: index,
            ..HeaderInfo::new(width, height, layout)
        })
    }

    async fn decode_raster(
        &self,
        reader: &dyn RangeReader,
        header: &HeaderInfo,
    ) -> Result<DynamicImage, ImageError> {
        if header.subimage == 0 {
            return decode_with_image(reader, FORMAT, ImageFormat::Tiff).await;
        }

        let encoded = read_whole_stream(reader, FORMAT).await?;
        let index = header.subimage as usize;
        run_blocking(FORMAT, move || decode_directory(&encoded, index)).await
    }
}

/// Decode directory `index` with the `tiff` crate.
fn decode_directory(encoded: &[u8], index: usize) -> Result<DynamicImage, ImageError> {
    let payload = |err: tiff::TiffError| -> ImageError {
        DecodeError::Payload {
            format: FORMAT,
            message: err.to_string(),
        }
        .into()
    };

    let mut decoder = Decoder::new(Cursor::new(encoded)).map_err(payload)?;
    decoder.seek_to_image(index).map_err(payload)?;
    let (width, height) = decoder.dimensions().map_err(payload)?;
    let color = decoder.colortype().map_err(payload)?;
    let samples = decoder.read_image().map_err(payload)?;

    let image = match (color, samples) {
        (ColorType::Gray(8), DecodingResult::U8(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageLuma8)
        }
        (ColorType::GrayA(8), DecodingResult::U8(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageLumaA8)
        }
        (ColorType::RGB(8), DecodingResult::U8(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgb8)
        }
        (ColorType::RGBA(8), DecodingResult::U8(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgba8)
        }
        (ColorType::Gray(16), DecodingResult::U16(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageLuma16)
        }
        (ColorType::GrayA(16), DecodingResult::U16(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageLumaA16)
        }
        (ColorType::RGB(16), DecodingResult::U16(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgb16)
        }
        (ColorType::RGBA(16), DecodingResult::U16(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgba16)
        }
        (other, _) => {
            return Err(DecodeError::Unsupported {
                format: FORMAT,
                feature: format!("directory {index} color type {other:?}"),
            }
            .into())
        }
    };

    image.ok_or_else(|| {
        DecodeError::Payload {
            format: FORMAT,
            message: format!("directory {index} sample buffer does not cover {width}x{height}"),
        }
        .into()
    })
}
