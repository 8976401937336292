//! The lazily materialized image handle.
//!
//! # Lifecycle
//!
//! ```text
//!   build() ──► Constructed ──get_tile──► PartiallyMaterialized ──► FullyMaterialized
//!               (metadata)                (some tiles cached)        (every tile cached)
//! ```
//!
//! Transitions happen only on tile requests. The state is derived from the
//! tile cache, so eviction under a small byte budget can move an image back
//! from fully to partially materialized.
//!
//! The decode unit is the whole raster: the first tile request decodes the
//! full image once, cuts it into tiles, and (unless the caller asked for
//! [`TileCachePolicy::Discard`]) caches every tile so later requests never
//! touch the stream again.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DecodeError, ImageError};
use crate::format::{EffectiveHints, FormatDecoder, HeaderInfo, TileCachePolicy};
use crate::io::SharedSource;

use super::block::{cut_tile, PixelBlock};
use super::info::ImageInfo;
use super::tile_cache::{CacheStats, TileCache, TileIndex};

/// How much of an image's pixel data has been materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializationState {
    /// Metadata only
    Constructed,
    /// Some tiles decoded and cached
    PartiallyMaterialized,
    /// Every tile decoded and cached
    FullyMaterialized,
}

/// A decoded image whose pixels are produced on demand.
///
/// Metadata is fixed at construction. Pixel access goes through
/// [`get_tile`](Self::get_tile); concurrent requests on one handle are
/// serialized so at most one decode reads the stream at a time.
pub struct RenderedImage {
    info: ImageInfo,
    header: HeaderInfo,
    hints: EffectiveHints,
    source: SharedSource,
    decoder: Arc<dyn FormatDecoder>,
    tiles: TileCache,

    /// Held for the duration of a decode
    decode_lock: Mutex<()>,

    /// Number of full-raster decodes started
    decodes: AtomicU64,
}

impl RenderedImage {
    pub(crate) fn new(
        info: ImageInfo,
        header: HeaderInfo,
        hints: EffectiveHints,
        source: SharedSource,
        decoder: Arc<dyn FormatDecoder>,
        cache_bytes: usize,
    ) -> Self {
        let tiles = TileCache::new(cache_bytes);
        Self {
            info,
            header,
            hints,
            source,
            decoder,
            tiles,
            decode_lock: Mutex::new(()),
            decodes: AtomicU64::new(0),
        }
    }

    /// Image metadata. Never performs I/O.
    pub fn metadata(&self) -> &ImageInfo {
        &self.info
    }

    /// Shorthand for [`metadata`](Self::metadata).
    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn format(&self) -> &'static str {
        self.info.format
    }

    /// Identifier of the underlying stream source.
    pub fn source_id(&self) -> &str {
        self.source.identifier()
    }

    /// Hints in effect after filtering by the format's hint table.
    pub fn hints(&self) -> &EffectiveHints {
        &self.hints
    }

    /// Fetch one tile, decoding the image on first use.
    ///
    /// # Errors
    /// - [`ImageError::TileOutOfBounds`] for coordinates outside the grid
    /// - [`ImageError::Decode`] when the payload is corrupt or truncated
    /// - [`ImageError::Input`] when the stream cannot be read
    pub async fn get_tile(&self, tile_x: u32, tile_y: u32) -> Result<PixelBlock, ImageError> {
        let rect = self
            .info
            .tile_rect(tile_x, tile_y)
            .ok_or(ImageError::TileOutOfBounds {
                x: tile_x,
                y: tile_y,
                tiles_x: self.info.tiles.tiles_x,
                tiles_y: self.info.tiles.tiles_y,
            })?;
        let index = TileIndex::new(tile_x, tile_y);

        if let Some(block) = self.tiles.get(index).await {
            return Ok(block);
        }

        let _decode = self.decode_lock.lock().await;

        // Another request may have decoded while we waited
        if let Some(block) = self.tiles.peek(index).await {
            return Ok(block);
        }

        let raster = self.materialize().await?;
        let layout = self.info.layout;
        let requested = cut_tile(&raster, self.info.width, layout, tile_x, tile_y, rect);

        if self.hints.tile_cache == TileCachePolicy::Retain {
            for ty in 0..self.info.tiles.tiles_y {
                for tx in 0..self.info.tiles.tiles_x {
                    if (tx, ty) == (tile_x, tile_y) {
                        continue;
                    }
                    if let Some(other) = self.info.tile_rect(tx, ty) {
                        let block = cut_tile(&raster, self.info.width, layout, tx, ty, other);
                        self.tiles.put(block).await;
                    }
                }
            }
            // Inserted last so it is the most recently used entry
            self.tiles.put(requested.clone()).await;
        }

        Ok(requested)
    }

    /// Decode the full raster and convert it to the output layout and size.
    async fn materialize(&self) -> Result<Vec<u8>, ImageError> {
        let started = Instant::now();
        self.decodes.fetch_add(1, Ordering::Relaxed);

        let decoded = self
            .decoder
            .decode_raster(self.source.as_ref(), &self.header)
            .await?;

        if (decoded.width(), decoded.height()) != (self.header.width, self.header.height) {
            return Err(DecodeError::DimensionMismatch {
                format: self.info.format,
                width: self.header.width,
                height: self.header.height,
                actual_width: decoded.width(),
                actual_height: decoded.height(),
            }
            .into());
        }

        let packed = self.info.layout.pack(&decoded);
        drop(decoded);

        let raster = if self.info.subsample > 1 {
            subsample(
                &packed,
                self.info.native_width,
                self.info.layout.bytes_per_pixel(),
                self.info.subsample,
                self.info.width,
                self.info.height,
            )
        } else {
            packed
        };

        debug!(
            source = self.source.identifier(),
            format = self.info.format,
            width = self.info.width,
            height = self.info.height,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Decoded raster"
        );

        Ok(raster)
    }

    /// Materialization state derived from the tile cache.
    pub async fn state(&self) -> MaterializationState {
        let cached = self.tiles.len().await;
        if cached == 0 {
            MaterializationState::Constructed
        } else if cached >= self.info.tiles.tile_count() {
            MaterializationState::FullyMaterialized
        } else {
            MaterializationState::PartiallyMaterialized
        }
    }

    pub async fn cached_tile_count(&self) -> usize {
        self.tiles.len().await
    }

    /// Number of full-raster decodes this handle has run.
    pub fn decode_count(&self) -> u64 {
        self.decodes.load(Ordering::Relaxed)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.tiles.stats().await
    }
}

impl fmt::Debug for RenderedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderedImage")
            .field("source", &self.source.identifier())
            .field("info", &self.info)
            .field("hints", &self.hints)
            .finish_non_exhaustive()
    }
}

/// Keep every `factor`-th pixel of every `factor`-th row.
fn subsample(
    raster: &[u8],
    native_width: u32,
    bpp: usize,
    factor: u32,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let native_stride = native_width as usize * bpp;
    let factor = factor as usize;
    let mut out = Vec::with_capacity(width as usize * height as usize * bpp);

    for row in 0..height as usize {
        let line = &raster[row * factor * native_stride..];
        for col in 0..width as usize {
            let start = col * factor * bpp;
            out.extend_from_slice(&line[start..start + bpp]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ImageFactory;
    use crate::format::{DecodeHints, FormatTag};
    use crate::io::MemoryRangeReader;
    use crate::raster::PixelLayout;
    use crate::BuildOptions;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    /// 5x3 grayscale PNG whose pixel value is `10 * y + x`
    fn gradient_png() -> SharedSource {
        let img = GrayImage::from_fn(5, 3, |x, y| Luma([(10 * y + x) as u8]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        Arc::new(MemoryRangeReader::new(out.into_inner(), "mem://gradient.png"))
    }

    fn factory(tile: u32) -> ImageFactory {
        ImageFactory::with_options(BuildOptions {
            tile_width: tile,
            tile_height: tile,
            ..BuildOptions::default()
        })
    }

    #[test]
    fn test_subsample_picks_top_left_of_each_block() {
        // 3x3 gray, factor 2 -> 2x2
        let raster: Vec<u8> = (0..9).collect();
        assert_eq!(subsample(&raster, 3, 1, 2, 2, 2), vec![0, 2, 6, 8]);
    }

    #[tokio::test]
    async fn test_tiles_cover_image() {
        let image = factory(2)
            .build(FormatTag::Png.as_str(), gradient_png(), None)
            .await
            .unwrap();
        assert_eq!(image.state().await, MaterializationState::Constructed);
        assert_eq!(image.decode_count(), 0);

        let tile = image.get_tile(2, 1).await.unwrap();
        assert_eq!((tile.x, tile.y, tile.width, tile.height), (4, 2, 1, 1));
        assert_eq!(&tile.data[..], &[24]);

        let tile = image.get_tile(1, 0).await.unwrap();
        assert_eq!(&tile.data[..], &[2, 3, 12, 13]);

        assert_eq!(image.decode_count(), 1);
        assert_eq!(image.state().await, MaterializationState::FullyMaterialized);
    }

    #[tokio::test]
    async fn test_out_of_bounds_tile() {
        let image = factory(2)
            .build("png", gradient_png(), None)
            .await
            .unwrap();
        let err = image.get_tile(3, 0).await.unwrap_err();
        assert!(matches!(
            err,
            ImageError::TileOutOfBounds {
                x: 3,
                tiles_x: 3,
                tiles_y: 2,
                ..
            }
        ));
        assert_eq!(image.decode_count(), 0);
    }

    #[tokio::test]
    async fn test_hints_change_output() {
        let hints = DecodeHints::new()
            .with_color(PixelLayout::Rgb8)
            .with_subsample(2);
        let image = factory(8)
            .build("png", gradient_png(), Some(&hints))
            .await
            .unwrap();

        assert_eq!((image.info().width, image.info().height), (3, 2));
        let tile = image.get_tile(0, 0).await.unwrap();
        assert_eq!(tile.layout, PixelLayout::Rgb8);
        // Row 1 of the output is native row 2; column 2 is native column 4
        assert_eq!(tile.pixel(2, 1), Some(&[24u8, 24, 24][..]));
    }

    #[tokio::test]
    async fn test_discard_policy_decodes_every_time() {
        let hints = DecodeHints::new().with_tile_cache(TileCachePolicy::Discard);
        let image = factory(2)
            .build("png", gradient_png(), Some(&hints))
            .await
            .unwrap();

        let first = image.get_tile(0, 0).await.unwrap();
        let second = image.get_tile(0, 0).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(image.decode_count(), 2);
        assert_eq!(image.state().await, MaterializationState::Constructed);
    }

    #[tokio::test]
    async fn test_small_budget_leaves_partial_state() {
        let options = BuildOptions {
            tile_width: 2,
            tile_height: 2,
            // Room for two 4-byte tiles only
            tile_cache_bytes: 8,
            ..BuildOptions::default()
        };
        let image = ImageFactory::with_options(options)
            .build("png", gradient_png(), None)
            .await
            .unwrap();

        image.get_tile(0, 0).await.unwrap();
        assert_eq!(
            image.state().await,
            MaterializationState::PartiallyMaterialized
        );

        // The requested tile was inserted last and survives eviction
        image.get_tile(0, 0).await.unwrap();
        assert_eq!(image.decode_count(), 1);
    }
}
