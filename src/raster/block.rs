use bytes::Bytes;

use super::info::PixelLayout;

/// One tile of decoded pixels.
///
/// Rows are packed top to bottom with no padding; `data.len()` is
/// `width * height * layout.bytes_per_pixel()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBlock {
    /// Tile column in the image's tile grid
    pub tile_x: u32,

    /// Tile row in the image's tile grid
    pub tile_y: u32,

    /// Pixel column of the tile's top-left corner
    pub x: u32,

    /// Pixel row of the tile's top-left corner
    pub y: u32,

    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub data: Bytes,
}

impl PixelBlock {
    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.layout.bytes_per_pixel()
    }

    /// Samples of one row, or `None` past the last row.
    pub fn row(&self, row: u32) -> Option<&[u8]> {
        if row >= self.height {
            return None;
        }
        let start = row as usize * self.stride();
        self.data.get(start..start + self.stride())
    }

    /// Samples of the pixel at tile-relative `(px, py)`.
    pub fn pixel(&self, px: u32, py: u32) -> Option<&[u8]> {
        if px >= self.width {
            return None;
        }
        let bpp = self.layout.bytes_per_pixel();
        let start = px as usize * bpp;
        self.row(py).and_then(|row| row.get(start..start + bpp))
    }

    /// Size of the pixel data in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Cut one tile out of a packed raster.
pub(crate) fn cut_tile(
    raster: &[u8],
    raster_width: u32,
    layout: PixelLayout,
    tile_x: u32,
    tile_y: u32,
    rect: (u32, u32, u32, u32),
) -> PixelBlock {
    let (x, y, width, height) = rect;
    let bpp = layout.bytes_per_pixel();
    let raster_stride = raster_width as usize * bpp;
    let tile_stride = width as usize * bpp;

    let mut data = Vec::with_capacity(tile_stride * height as usize);
    for row in y..y + height {
        let start = row as usize * raster_stride + x as usize * bpp;
        data.extend_from_slice(&raster[start..start + tile_stride]);
    }

    PixelBlock {
        tile_x,
        tile_y,
        x,
        y,
        width,
        height,
        layout,
        data: Bytes::from(data),
    }
}
