//! Subimage header and tile payloads.
//!
//! Every resolution keeps two streams: `Subimage 0000 Header` describes the
//! tile grid and holds a table with one 16-byte entry per tile, and
//! `Subimage 0000 Data` holds the tiles. Both streams start with a 28-byte
//! preamble that stored offsets do not count.
//!
//! A tile is raw interleaved channels, a single color packed into the entry,
//! or a JPEG stream that may share its quantization and Huffman tables with
//! other tiles through the `Image Contents` property set.

use std::collections::HashMap;

use image::{DynamicImage, ImageBuffer, ImageFormat};

use crate::error::{DecodeError, ImageError};
use crate::format::decoder::{invalid_header, payload_error};
use crate::io::read_u32_le;

use super::FORMAT;

/// Preamble in front of the header fields and the tile data
const STREAM_PREAMBLE: u64 = 28;

/// Preamble plus the nine header fields
pub const HEADER_LEN: usize = 64;

const TILE_ENTRY_LEN: usize = 16;

/// Longer tile edges are treated as corruption
const MAX_TILE_SIDE: u32 = 8192;

const COMPRESSION_NONE: u32 = 0;
const COMPRESSION_SINGLE_COLOR: u32 = 1;
const COMPRESSION_JPEG: u32 = 2;

/// Color space codes of the subimage color blob
pub const COLOR_SPACE_PHOTO_YCC: u32 = 2;
pub const COLOR_SPACE_NIF_RGB: u32 = 3;

/// JPEG conversion flag: components were converted from RGB to YCbCr
const JPEG_CONVERSION_YCBCR: u8 = 1;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// PhotoYCC levels 0..=360 mapped to 8-bit RGB.
static PHOTO_YCC_LUT: [u8; 361] = [
    0, 1, 1, 2, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13,
    14, 15, 16, 17, 18, 19, 20, 22, 23, 24, 25, 26, 28, 29, 30, 31,
    33, 34, 35, 36, 38, 39, 40, 41, 43, 44, 45, 47, 48, 49, 51, 52,
    53, 55, 56, 57, 59, 60, 61, 63, 64, 65, 67, 68, 70, 71, 72, 74,
    75, 76, 78, 79, 81, 82, 83, 85, 86, 88, 89, 91, 92, 93, 95, 96,
    98, 99, 101, 102, 103, 105, 106, 108, 109, 111, 112, 113, 115, 116, 118, 119,
    121, 122, 123, 125, 126, 128, 129, 130, 132, 133, 134, 136, 137, 138, 140, 141,
    142, 144, 145, 146, 148, 149, 150, 152, 153, 154, 155, 157, 158, 159, 160, 162,
    163, 164, 165, 166, 168, 169, 170, 171, 172, 174, 175, 176, 177, 178, 179, 180,
    182, 183, 184, 185, 186, 187, 188, 189, 190, 191, 192, 194, 195, 196, 197, 198,
    199, 200, 201, 202, 203, 204, 204, 205, 206, 207, 208, 209, 210, 211, 212, 213,
    213, 214, 215, 216, 217, 217, 218, 219, 220, 221, 221, 222, 223, 223, 224, 225,
    225, 226, 227, 227, 228, 229, 229, 230, 230, 231, 231, 232, 233, 233, 234, 234,
    235, 235, 236, 236, 236, 237, 237, 238, 238, 238, 239, 239, 240, 240, 240, 241,
    241, 241, 242, 242, 242, 242, 243, 243, 243, 244, 244, 244, 244, 245, 245, 245,
    245, 245, 246, 246, 246, 246, 246, 247, 247, 247, 247, 247, 247, 248, 248, 248,
    248, 248, 248, 249, 249, 249, 249, 249, 249, 249, 249, 249, 250, 250, 250, 250,
    250, 250, 250, 250, 250, 250, 251, 251, 251, 251, 251, 251, 251, 251, 251, 251,
    251, 251, 251, 251, 252, 252, 252, 252, 252, 252, 252, 252, 252, 252, 252, 252,
    252, 252, 252, 252, 252, 253, 253, 253, 253, 253, 253, 253, 253, 253, 253, 253,
    253, 253, 253, 253, 253, 253, 253, 254, 254, 254, 254, 254, 254, 254, 254, 254,
    254, 254, 254, 254, 254, 254, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255,
    255, 255, 255, 255, 255, 255, 255, 255, 255,
];

// =============================================================================
// SubimageHeader
// =============================================================================

/// The fixed fields of a `Subimage 0000 Header` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubimageHeader {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub channels: u32,

    /// Offset of the tile table within the header stream
    pub table_offset: u64,
}

impl SubimageHeader {
    /// Parse the first [`HEADER_LEN`] bytes of the header stream.
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        let fields = bytes
            .get(STREAM_PREAMBLE as usize..HEADER_LEN)
            .ok_or_else(|| invalid_header(FORMAT, "subimage header truncated"))?;
        let field = |i: usize| read_u32_le(&fields[4 * i..]);

        // Field 0 is the header length, field 8 the table entry length
        let header = Self {
            width: field(1),
            height: field(2),
            tile_width: field(4),
            tile_height: field(5),
            channels: field(6),
            table_offset: field(7) as u64 + STREAM_PREAMBLE,
        };
        let declared_tiles = field(3);

        if !(1..=MAX_TILE_SIDE).contains(&header.tile_width)
            || !(1..=MAX_TILE_SIDE).contains(&header.tile_height)
        {
            return Err(invalid_header(
                FORMAT,
                format!("tile size {}x{}", header.tile_width, header.tile_height),
            ));
        }
        if !(1..=4).contains(&header.channels) {
            return Err(invalid_header(
                FORMAT,
                format!("{} channels", header.channels),
            ));
        }
        if (declared_tiles as u64) < header.tile_count() {
            return Err(invalid_header(
                FORMAT,
                format!(
                    "{declared_tiles} tiles declared, grid needs {}",
                    header.tile_count()
                ),
            ));
        }

        Ok(header)
    }

    pub fn tiles_across(&self) -> u32 {
        self.width.div_ceil(self.tile_width)
    }

    pub fn tiles_down(&self) -> u32 {
        self.height.div_ceil(self.tile_height)
    }

    pub fn tile_count(&self) -> u64 {
        self.tiles_across() as u64 * self.tiles_down() as u64
    }

    /// Byte length of the tile table covering the grid.
    pub fn table_len(&self) -> u64 {
        self.tile_count() * TILE_ENTRY_LEN as u64
    }

    fn tile_pixels(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize
    }

    fn tile_bytes(&self) -> usize {
        self.tile_pixels() * self.channels as usize
    }
}

// =============================================================================
// TileEntry
// =============================================================================

/// One entry of the tile table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TileEntry {
    /// Offset within the data stream
    offset: u64,
    size: u32,
    compression: u32,
    subtype: u32,
}

impl TileEntry {
    fn parse(raw: &[u8]) -> Self {
        Self {
            offset: read_u32_le(raw) as u64 + STREAM_PREAMBLE,
            size: read_u32_le(&raw[4..]),
            compression: read_u32_le(&raw[8..]),
            subtype: read_u32_le(&raw[12..]),
        }
    }
}

// =============================================================================
// Tile assembly
// =============================================================================

/// Everything needed to decode one resolution, read up front.
pub struct TileSource<'a> {
    pub header: SubimageHeader,

    /// Color space of the first channel
    pub color_space: u32,

    /// Tile table bytes, [`SubimageHeader::table_len`] long
    pub table: &'a [u8],

    /// The whole data stream
    pub data: &'a [u8],

    /// JPEG table blobs by index
    pub jpeg_tables: &'a HashMap<u8, Vec<u8>>,
}

impl TileSource<'_> {
    /// Decode every tile and stitch the grid into one image.
    pub fn assemble(&self) -> Result<DynamicImage, ImageError> {
        let header = &self.header;
        let channels = header.channels as usize;
        let (width, height) = (header.width as usize, header.height as usize);
        let (tile_width, tile_height) = (header.tile_width as usize, header.tile_height as usize);
        let across = header.tiles_across() as usize;

        let mut out = vec![0u8; width * height * channels];
        for (index, raw) in self.table.chunks_exact(TILE_ENTRY_LEN).enumerate() {
            let pixels = self.tile(index, TileEntry::parse(raw))?;

            let left = (index % across) * tile_width;
            let top = (index / across) * tile_height;
            let row_bytes = tile_width.min(width - left) * channels;
            for row in 0..tile_height.min(height - top) {
                let src = row * tile_width * channels;
                let dst = ((top + row) * width + left) * channels;
                out[dst..dst + row_bytes].copy_from_slice(&pixels[src..src + row_bytes]);
            }
        }

        let (width, height) = (header.width, header.height);
        let image = match channels {
            1 => ImageBuffer::from_raw(width, height, out).map(DynamicImage::ImageLuma8),
            2 => ImageBuffer::from_raw(width, height, out).map(DynamicImage::ImageLumaA8),
            3 => ImageBuffer::from_raw(width, height, out).map(DynamicImage::ImageRgb8),
            _ => ImageBuffer::from_raw(width, height, out).map(DynamicImage::ImageRgba8),
        };
        image.ok_or_else(|| invalid_header(FORMAT, "subimage buffer size"))
    }

    /// Pixels of one tile, `tile_width * tile_height * channels` bytes.
    fn tile(&self, index: usize, entry: TileEntry) -> Result<Vec<u8>, ImageError> {
        let channels = self.header.channels as usize;

        match entry.compression {
            COMPRESSION_NONE => {
                let mut pixels = self.payload(index, entry.offset, self.header.tile_bytes())?;
                if self.color_space == COLOR_SPACE_PHOTO_YCC && channels >= 3 {
                    pixels.chunks_exact_mut(channels).for_each(photo_ycc_in_place);
                }
                Ok(pixels)
            }
            COMPRESSION_SINGLE_COLOR => {
                // One byte per channel, first channel in the low byte
                let mut color = entry.subtype.to_le_bytes();
                if self.color_space == COLOR_SPACE_PHOTO_YCC && channels >= 3 {
                    photo_ycc_in_place(&mut color);
                }
                Ok(color[..channels].repeat(self.header.tile_pixels()))
            }
            COMPRESSION_JPEG => {
                let [_interleave, _chroma, conversion, table] = entry.subtype.to_le_bytes();
                let body = self.payload(index, entry.offset, entry.size as usize)?;
                let stream = if table == 0 {
                    body
                } else {
                    let tables = self.jpeg_tables.get(&table).ok_or_else(|| {
                        invalid_header(
                            FORMAT,
                            format!("tile {index} uses missing JPEG table {table}"),
                        )
                    })?;
                    splice_jpeg(tables, &body)
                };
                self.jpeg_tile(&stream, conversion)
            }
            other => Err(DecodeError::Unsupported {
                format: FORMAT,
                feature: format!("tile compression type {other}"),
            }
            .into()),
        }
    }

    fn payload(&self, index: usize, offset: u64, len: usize) -> Result<Vec<u8>, ImageError> {
        usize::try_from(offset)
            .ok()
            .and_then(|start| self.data.get(start..start.checked_add(len)?))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                invalid_header(
                    FORMAT,
                    format!("tile {index} at {offset}+{len} outside the data stream"),
                )
            })
    }

    fn jpeg_tile(&self, stream: &[u8], conversion: u8) -> Result<Vec<u8>, ImageError> {
        let header = &self.header;
        if !matches!(header.channels, 1 | 3) {
            return Err(DecodeError::Unsupported {
                format: FORMAT,
                feature: format!("JPEG tiles with {} channels", header.channels),
            }
            .into());
        }

        let decoded = image::load_from_memory_with_format(stream, ImageFormat::Jpeg)
            .map_err(|err| payload_error(FORMAT, err))?;
        if (decoded.width(), decoded.height()) != (header.tile_width, header.tile_height) {
            return Err(DecodeError::DimensionMismatch {
                format: FORMAT,
                width: header.tile_width,
                height: header.tile_height,
                actual_width: decoded.width(),
                actual_height: decoded.height(),
            }
            .into());
        }

        if header.channels == 1 {
            return Ok(decoded.into_luma8().into_raw());
        }

        let mut pixels = decoded.into_rgb8().into_raw();
        let stored_as_nif_ycbcr =
            conversion == JPEG_CONVERSION_YCBCR && self.color_space == COLOR_SPACE_NIF_RGB;
        if !stored_as_nif_ycbcr {
            // The JPEG backend always applies YCbCr to RGB; undo it to recover
            // the stored components
            for px in pixels.chunks_exact_mut(3) {
                rgb_to_jfif_ycc(px);
                if conversion == 0 && self.color_space == COLOR_SPACE_PHOTO_YCC {
                    photo_ycc_in_place(px);
                }
            }
        }
        Ok(pixels)
    }
}

/// Join a tables-only JPEG stream and an abbreviated tile stream.
fn splice_jpeg(tables: &[u8], tile: &[u8]) -> Vec<u8> {
    let tables = tables.strip_prefix(&SOI).unwrap_or(tables);
    let tables = tables.strip_suffix(&EOI).unwrap_or(tables);
    let tile = tile.strip_prefix(&SOI).unwrap_or(tile);

    let mut stream = Vec::with_capacity(SOI.len() + tables.len() + tile.len());
    stream.extend_from_slice(&SOI);
    stream.extend_from_slice(tables);
    stream.extend_from_slice(tile);
    stream
}

// =============================================================================
// Color conversion
// =============================================================================

/// Convert the first three bytes of `px` from PhotoYCC to RGB.
fn photo_ycc_in_place(px: &mut [u8]) {
    let scaled_y = f32::from(px[0]) * 1.3584;
    let cb = f32::from(px[1]);
    let cr = f32::from(px[2]);

    px[0] = photo_ycc_level(scaled_y + 1.8215 * cr - 249.55);
    px[1] = photo_ycc_level(scaled_y - 0.43031 * cb - 0.9271 * cr + 194.14);
    px[2] = photo_ycc_level(scaled_y + 2.2179 * cb - 345.99);
}

fn photo_ycc_level(value: f32) -> u8 {
    if value < 0.0 {
        0
    } else if value > 360.0 {
        255
    } else {
        PHOTO_YCC_LUT[value as usize]
    }
}

/// Forward JFIF transform, the inverse of what the JPEG backend applied.
fn rgb_to_jfif_ycc(px: &mut [u8]) {
    let (r, g, b) = (f32::from(px[0]), f32::from(px[1]), f32::from(px[2]));
    let level = |v: f32| v.round().clamp(0.0, 255.0) as u8;

    px[0] = level(0.299 * r + 0.587 * g + 0.114 * b);
    px[1] = level(128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b);
    px[2] = level(128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b);
}

/// Serialize a header stream and its tile table.
///
/// `tiles` holds `(data offset, size, compression, subtype)` with offsets
/// counted from the end of the data stream preamble.
#[cfg(test)]
pub(crate) fn build_test_header(
    width: u32,
    height: u32,
    tile: u32,
    channels: u32,
    tiles: &[(u32, u32, u32, u32)],
) -> Vec<u8> {
    let mut out = vec![0u8; STREAM_PREAMBLE as usize];
    let fields = [
        HEADER_LEN as u32 - STREAM_PREAMBLE as u32,
        width,
        height,
        tiles.len() as u32,
        tile,
        tile,
        channels,
        HEADER_LEN as u32 - STREAM_PREAMBLE as u32,
        TILE_ENTRY_LEN as u32,
    ];
    for value in fields {
        out.extend_from_slice(&value.to_le_bytes());
    }
    for &(offset, size, compression, subtype) in tiles {
        for value in [offset, size, compression, subtype] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}

/// Prefix tile payloads with the data stream preamble.
#[cfg(test)]
pub(crate) fn build_test_data(payloads: &[&[u8]]) -> Vec<u8> {
    let mut out = vec![0u8; STREAM_PREAMBLE as usize];
    for payload in payloads {
        out.extend_from_slice(payload);
    }
    out
}
