//! Image metadata available immediately after construction.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

// =============================================================================
// PixelLayout
// =============================================================================

/// Channel arrangement and sample depth of decoded pixels.
///
/// 16-bit layouts store each sample as two little-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelLayout {
    Gray8,
    GrayAlpha8,
    Rgb8,
    Rgba8,
    Gray16,
    GrayAlpha16,
    Rgb16,
    Rgba16,
}

impl PixelLayout {
    /// Number of channels per pixel.
    pub const fn channels(self) -> usize {
        match self {
            PixelLayout::Gray8 | PixelLayout::Gray16 => 1,
            PixelLayout::GrayAlpha8 | PixelLayout::GrayAlpha16 => 2,
            PixelLayout::Rgb8 | PixelLayout::Rgb16 => 3,
            PixelLayout::Rgba8 | PixelLayout::Rgba16 => 4,
        }
    }

    /// Bytes per channel sample.
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            PixelLayout::Gray8
            | PixelLayout::GrayAlpha8
            | PixelLayout::Rgb8
            | PixelLayout::Rgba8 => 1,
            _ => 2,
        }
    }

    /// Bytes per pixel.
    pub const fn bytes_per_pixel(self) -> usize {
        self.channels() * self.bytes_per_sample()
    }

    pub const fn has_alpha(self) -> bool {
        matches!(
            self,
            PixelLayout::GrayAlpha8
                | PixelLayout::Rgba8
                | PixelLayout::GrayAlpha16
                | PixelLayout::Rgba16
        )
    }

    /// Pick a layout from a channel count and bit depth.
    ///
    /// Depths above 8 map to the 16-bit layouts; channel counts outside 1..=4
    /// have no layout.
    pub fn from_channels(channels: u16, bit_depth: u16) -> Option<Self> {
        let wide = bit_depth > 8;
        let layout = match (channels, wide) {
            (1, false) => PixelLayout::Gray8,
            (2, false) => PixelLayout::GrayAlpha8,
            (3, false) => PixelLayout::Rgb8,
            (4, false) => PixelLayout::Rgba8,
            (1, true) => PixelLayout::Gray16,
            (2, true) => PixelLayout::GrayAlpha16,
            (3, true) => PixelLayout::Rgb16,
            (4, true) => PixelLayout::Rgba16,
            _ => return None,
        };
        Some(layout)
    }

    /// Convert a decoded image into packed pixels of this layout.
    pub(crate) fn pack(self, img: &DynamicImage) -> Vec<u8> {
        match self {
            PixelLayout::Gray8 => img.to_luma8().into_raw(),
            PixelLayout::GrayAlpha8 => img.to_luma_alpha8().into_raw(),
            PixelLayout::Rgb8 => img.to_rgb8().into_raw(),
            PixelLayout::Rgba8 => img.to_rgba8().into_raw(),
            PixelLayout::Gray16 => widen(img.to_luma16().into_raw()),
            PixelLayout::GrayAlpha16 => widen(img.to_luma_alpha16().into_raw()),
            PixelLayout::Rgb16 => widen(img.to_rgb16().into_raw()),
            PixelLayout::Rgba16 => widen(img.to_rgba16().into_raw()),
        }
    }
}

fn widen(samples: Vec<u16>) -> Vec<u8> {
    samples.into_iter().flat_map(u16::to_le_bytes).collect()
}

// =============================================================================
// TileLayout
// =============================================================================

/// Regular grid of tiles covering an image.
///
/// Edge tiles are clipped to the image bounds and may be smaller than
/// `tile_width` x `tile_height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileLayout {
    pub tile_width: u32,
    pub tile_height: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
}

impl TileLayout {
    /// Lay out tiles of at most `tile_width` x `tile_height` over an image.
    ///
    /// Tile dimensions are clamped to `1..=image dimension`.
    pub fn new(width: u32, height: u32, tile_width: u32, tile_height: u32) -> Self {
        let tile_width = tile_width.clamp(1, width.max(1));
        let tile_height = tile_height.clamp(1, height.max(1));
        Self {
            tile_width,
            tile_height,
            tiles_x: width.div_ceil(tile_width),
            tiles_y: height.div_ceil(tile_height),
        }
    }

    /// Total number of tiles.
    pub fn tile_count(&self) -> usize {
        self.tiles_x as usize * self.tiles_y as usize
    }

    pub fn contains(&self, tile_x: u32, tile_y: u32) -> bool {
        tile_x < self.tiles_x && tile_y < self.tiles_y
    }

    /// Pixel rectangle `(x, y, width, height)` of a tile within an image of
    /// the given size, or `None` when outside the grid.
    pub fn tile_rect(
        &self,
        image_width: u32,
        image_height: u32,
        tile_x: u32,
        tile_y: u32,
    ) -> Option<(u32, u32, u32, u32)> {
        if !self.contains(tile_x, tile_y) {
            return None;
        }

        let x = tile_x * self.tile_width;
        let y = tile_y * self.tile_height;
        let width = self.tile_width.min(image_width - x);
        let height = self.tile_height.min(image_height - y);
        Some((x, y, width, height))
    }
}

// =============================================================================
// ImageInfo
// =============================================================================

/// Metadata of a rendered image.
///
/// Computed from the stream header during construction and never changed
/// afterwards. `width`/`height` are the dimensions of the rendered output,
/// after any subsampling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    /// Registry name of the format that decoded this image
    pub format: &'static str,

    pub width: u32,
    pub height: u32,

    /// Layout of pixels returned by tile requests
    pub layout: PixelLayout,

    /// Layout the stream declares natively
    pub native_layout: PixelLayout,

    /// Dimensions declared by the stream header
    pub native_width: u32,
    pub native_height: u32,

    /// Integer downscale factor applied to the native raster (1 = none)
    pub subsample: u32,

    /// TIFF directory or FlashPix resolution the image was read from
    pub subimage: u32,

    pub tiles: TileLayout,
}

impl ImageInfo {
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Pixel rectangle of a tile, or `None` when outside the grid.
    pub fn tile_rect(&self, tile_x: u32, tile_y: u32) -> Option<(u32, u32, u32, u32)> {
        self.tiles.tile_rect(self.width, self.height, tile_x, tile_y)
    }
}
