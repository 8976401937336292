//! FlashPix decoder.
//!
//! A FlashPix file is an OLE compound document holding a pyramid of
//! resolutions. The `Image Contents` property set of the first data object
//! store lists the resolutions and their color spaces; each resolution keeps
//! its tile grid in a `Resolution NNNN` storage.
//!
//! The header reader walks the allocation tables, the directory, the property
//! set and the first 64 bytes of one subimage header. The tile payloads are
//! read only when the raster is decoded.

mod properties;
mod storage;
mod subimage;

use std::collections::HashMap;

use async_trait::async_trait;
use image::DynamicImage;

use crate::error::{DecodeError, ImageError};
use crate::io::{read_u32_le, RangeReader};
use crate::raster::PixelLayout;

use super::decoder::{invalid_header, run_blocking, FormatDecoder, HeaderInfo};

use properties::PropertySet;
use storage::{CompoundFile, DirEntry};
use subimage::{SubimageHeader, TileSource, HEADER_LEN};

pub(crate) const FORMAT: &str = "fpx";

const DATA_OBJECT_STORE: &str = "Data Object Store 000001";
const IMAGE_CONTENTS: &str = "Image Contents";
const SUBIMAGE_HEADER: &str = "Subimage 0000 Header";
const SUBIMAGE_DATA: &str = "Subimage 0000 Data";

/// Image Contents property ids; per-resolution ids carry the index in bits 16..24
const PID_RESOLUTION_COUNT: u32 = 0x0100_0000;
const PID_SUBIMAGE_WIDTH: u32 = 0x0200_0000;
const PID_SUBIMAGE_COLOR: u32 = 0x0200_0002;
const PID_JPEG_TABLES: u32 = 0x0300_0001;
const PID_MAX_JPEG_TABLE: u32 = 0x0300_0002;

/// Resolution and JPEG table indices fit in one byte of the property id
const MAX_INDEXED: u32 = 256;

/// Property sets larger than this are not plausible image descriptions
const MAX_PROPERTY_SET_LEN: u64 = 1024 * 1024;

const fn indexed(pid: u32, index: u32) -> u32 {
    pid | (index << 16)
}

fn resolution_storage(index: u32) -> String {
    format!("Resolution {index:04}")
}

// =============================================================================
// Image Contents
// =============================================================================

/// The `Image Contents` property set.
struct ImageContents(PropertySet);

impl ImageContents {
    async fn read(file: &CompoundFile, reader: &dyn RangeReader) -> Result<Self, ImageError> {
        let entry = file
            .find(&[DATA_OBJECT_STORE, IMAGE_CONTENTS])
            .ok_or_else(|| invalid_header(FORMAT, "no Image Contents property set"))?;
        if entry.size > MAX_PROPERTY_SET_LEN {
            return Err(invalid_header(
                FORMAT,
                format!("Image Contents of {} bytes", entry.size),
            ));
        }

        let bytes = file.read_stream(reader, entry).await?;
        Ok(Self(PropertySet::parse(&bytes)?))
    }

    /// Resolutions described from index 0 up to the first gap.
    fn valid_resolutions(&self) -> Result<u32, ImageError> {
        let declared = self
            .0
            .get_u32(PID_RESOLUTION_COUNT)
            .ok_or_else(|| invalid_header(FORMAT, "missing resolution count"))?;

        let valid = (0..declared.min(MAX_INDEXED))
            .take_while(|&i| self.0.get(indexed(PID_SUBIMAGE_WIDTH, i)).is_some())
            .count();
        Ok(valid as u32)
    }

    /// Pick a resolution; the highest described one unless `requested`.
    fn select(&self, requested: Option<u32>) -> Result<u32, ImageError> {
        let valid = self.valid_resolutions()?;
        match requested {
            _ if valid == 0 => Err(invalid_header(FORMAT, "no resolution is described")),
            None => Ok(valid - 1),
            Some(index) if index < valid => Ok(index),
            Some(index) => Err(invalid_header(
                FORMAT,
                format!("resolution {index} requested, file describes {valid}"),
            )),
        }
    }

    /// Color space of the first channel, 0 when the color blob is absent.
    fn color_space(&self, resolution: u32) -> u32 {
        self.0
            .get_blob(indexed(PID_SUBIMAGE_COLOR, resolution))
            .and_then(|blob| blob.get(8..12))
            .map(|color| (read_u32_le(color) & 0x7fff_ffff) >> 16)
            .unwrap_or(0)
    }

    fn jpeg_tables(&self) -> HashMap<u8, Vec<u8>> {
        let Some(max) = self.0.get_u32(PID_MAX_JPEG_TABLE) else {
            return HashMap::new();
        };
        (0..=max.min(MAX_INDEXED - 1))
            .filter_map(|i| {
                let blob = self.0.get_blob(indexed(PID_JPEG_TABLES, i))?;
                Some((i as u8, blob.to_vec()))
            })
            .collect()
    }
}

/// Locate one of the two streams of a resolution.
fn subimage_stream<'f>(
    file: &'f CompoundFile,
    resolution: u32,
    stream: &str,
) -> Result<&'f DirEntry, ImageError> {
    let storage = resolution_storage(resolution);
    file.find(&[DATA_OBJECT_STORE, storage.as_str(), stream])
        .ok_or_else(|| invalid_header(FORMAT, format!("{storage} has no {stream} stream")))
}

async fn load_subimage_header(
    file: &CompoundFile,
    reader: &dyn RangeReader,
    resolution: u32,
) -> Result<SubimageHeader, ImageError> {
    let entry = subimage_stream(file, resolution, SUBIMAGE_HEADER)?;
    let bytes = file.read_stream_range(reader, entry, 0, HEADER_LEN).await?;
    SubimageHeader::parse(&bytes)
}

// =============================================================================
// Decoder
// =============================================================================

/// Decoder for FlashPix files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FpxDecoder;

impl FpxDecoder {
    async fn open_resolution(
        &self,
        reader: &dyn RangeReader,
        requested: Option<u32>,
    ) -> Result<HeaderInfo, ImageError> {
        let file = CompoundFile::open(reader).await?;
        let contents = ImageContents::read(&file, reader).await?;
        let resolution = contents.select(requested)?;
        let header = load_subimage_header(&file, reader, resolution).await?;

        let layout = PixelLayout::from_channels(header.channels as u16, 8)
            .ok_or_else(|| invalid_header(FORMAT, format!("{} channels", header.channels)))?;

        Ok(HeaderInfo {
            subimage: resolution,
            ..HeaderInfo::new(header.width, header.height, layout)
        })
    }
}

#[async_trait]
impl FormatDecoder for FpxDecoder {
    fn name(&self) -> &'static str {
        FORMAT
    }

    fn signature_len(&self) -> usize {
        storage::SIGNATURE.len()
    }

    fn signature(&self) -> &'static str {
        "D0 CF 11 E0 A1 B1 1A E1"
    }

    fn matches_signature(&self, leading: &[u8]) -> bool {
        leading.starts_with(&storage::SIGNATURE)
    }

    async fn read_header(&self, reader: &dyn RangeReader) -> Result<HeaderInfo, ImageError> {
        self.open_resolution(reader, None).await
    }

    async fn read_subimage_header(
        &self,
        reader: &dyn RangeReader,
        index: u32,
    ) -> Result<HeaderInfo, ImageError> {
        self.open_resolution(reader, Some(index)).await
    }

    async fn decode_raster(
        &self,
        reader: &dyn RangeReader,
        header: &HeaderInfo,
    ) -> Result<DynamicImage, ImageError> {
        let resolution = header.subimage;
        let file = CompoundFile::open(reader).await?;
        let contents = ImageContents::read(&file, reader).await?;
        let subimage = load_subimage_header(&file, reader, resolution).await?;

        if (subimage.width, subimage.height) != (header.width, header.height) {
            return Err(DecodeError::DimensionMismatch {
                format: FORMAT,
                width: header.width,
                height: header.height,
                actual_width: subimage.width,
                actual_height: subimage.height,
            }
            .into());
        }

        let table_len = usize::try_from(subimage.table_len())
            .map_err(|_| invalid_header(FORMAT, "tile table does not fit in memory"))?;
        let table = file
            .read_stream_range(
                reader,
                subimage_stream(&file, resolution, SUBIMAGE_HEADER)?,
                subimage.table_offset,
                table_len,
            )
            .await?;
        let data = file
            .read_stream(reader, subimage_stream(&file, resolution, SUBIMAGE_DATA)?)
            .await?;

        let color_space = contents.color_space(resolution);
        let jpeg_tables = contents.jpeg_tables();

        run_blocking(FORMAT, move || {
            TileSource {
                header: subimage,
                color_space,
                table: &table,
                data: &data,
                jpeg_tables: &jpeg_tables,
            }
            .assemble()
        })
        .await
    }
}
