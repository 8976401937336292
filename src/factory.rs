//! The construction routine shared by every format adapter.
//!
//! # Build sequence
//!
//! ```text
//! tag ──► registry lookup ──► signature check ──► hint resolution ──► header read
//!                                                                        │
//!        RenderedImage ◄── metadata (dims, layout, tiles) ◄── limits ◄───┘
//! ```
//!
//! Everything up to the returned handle uses bounded reads of the stream's
//! leading structures. The pixel payload is not read until a tile is
//! requested.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{DecodeError, ImageError};
use crate::format::{DecodeHints, FormatRegistry, HeaderInfo};
use crate::io::SharedSource;
use crate::raster::{ImageInfo, RenderedImage, TileLayout, DEFAULT_TILE_CACHE_BYTES};

// =============================================================================
// Configuration
// =============================================================================

/// Default tile edge length in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Default pixel limit: 2^28 (16384 x 16384).
pub const DEFAULT_MAX_PIXELS: u64 = 1 << 28;

/// Settings applied to every image a factory builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub tile_width: u32,
    pub tile_height: u32,

    /// Byte budget of each image's tile cache
    pub tile_cache_bytes: usize,

    /// Largest accepted `width * height` as declared by the header
    pub max_pixels: u64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            tile_width: DEFAULT_TILE_SIZE,
            tile_height: DEFAULT_TILE_SIZE,
            tile_cache_bytes: DEFAULT_TILE_CACHE_BYTES,
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

// =============================================================================
// ConstructionRoutine
// =============================================================================

/// Builds a rendered image from a format tag, a stream and optional hints.
///
/// Format adapters depend on this trait rather than on [`ImageFactory`], so
/// tests can substitute a recording implementation.
#[async_trait]
pub trait ConstructionRoutine: Send + Sync {
    async fn build(
        &self,
        tag: &str,
        source: SharedSource,
        hints: Option<&DecodeHints>,
    ) -> Result<RenderedImage, ImageError> {
        self.build_subimage(tag, source, hints, None).await
    }

    /// Build from one image of a multi-image stream, or the format's
    /// default image when `subimage` is `None`.
    async fn build_subimage(
        &self,
        tag: &str,
        source: SharedSource,
        hints: Option<&DecodeHints>,
        subimage: Option<u32>,
    ) -> Result<RenderedImage, ImageError>;
}

// =============================================================================
// ImageFactory
// =============================================================================

/// The standard construction routine.
#[derive(Debug, Clone)]
pub struct ImageFactory {
    registry: Arc<FormatRegistry>,
    options: BuildOptions,
}

impl Default for ImageFactory {
    fn default() -> Self {
        Self::new(FormatRegistry::standard())
    }
}

impl ImageFactory {
    /// Create a factory over a registry with default options.
    pub fn new(registry: FormatRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            options: BuildOptions::default(),
        }
    }

    /// Standard registry with custom options.
    pub fn with_options(options: BuildOptions) -> Self {
        Self::new(FormatRegistry::standard()).options(options)
    }

    /// Replace the build options.
    pub fn options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    pub fn build_options(&self) -> &BuildOptions {
        &self.options
    }

    /// Validate a stream against a format and return a lazy image handle.
    ///
    /// # Errors
    /// - [`ImageError::UnsupportedFormat`] if `tag` is not registered
    /// - [`ImageError::Decode`] if the stream does not conform to the format
    /// - [`ImageError::Input`] if the stream cannot be read
    pub async fn build(
        &self,
        tag: &str,
        source: SharedSource,
        hints: Option<&DecodeHints>,
    ) -> Result<RenderedImage, ImageError> {
        self.build_subimage(tag, source, hints, None).await
    }

    /// Like [`build`](Self::build), selecting a TIFF directory or FlashPix
    /// resolution.
    ///
    /// Formats holding a single image reject any index but 0 with
    /// [`DecodeError::Unsupported`].
    pub async fn build_subimage(
        &self,
        tag: &str,
        source: SharedSource,
        hints: Option<&DecodeHints>,
        subimage: Option<u32>,
    ) -> Result<RenderedImage, ImageError> {
        let started = Instant::now();
        let entry = self.registry.lookup(tag)?;
        let decoder = Arc::clone(&entry.decoder);
        let format = entry.name;

        // Cheap gate before any structural parsing
        let signature_len = decoder.signature_len();
        let size = source.size();
        if size < signature_len as u64 {
            return Err(DecodeError::Truncated {
                format,
                required: signature_len as u64,
                actual: size,
            }
            .into());
        }
        let leading = source.read_exact_at(0, signature_len).await?;
        if !decoder.matches_signature(&leading) {
            return Err(DecodeError::SignatureMismatch {
                format,
                expected: decoder.signature(),
            }
            .into());
        }

        let effective = entry.hint_support.resolve(hints);
        if hints.is_some() && !entry.hint_support.honors_any() {
            debug!(format, "Format ignores decoding hints");
        }

        let header = match subimage {
            Some(index) => decoder.read_subimage_header(source.as_ref(), index).await?,
            None => decoder.read_header(source.as_ref()).await?,
        };
        self.check_limits(format, &header)?;

        let native_width = header.width;
        let native_height = header.height;
        let width = native_width.div_ceil(effective.subsample);
        let height = native_height.div_ceil(effective.subsample);

        let info = ImageInfo {
            format,
            width,
            height,
            layout: effective.color.unwrap_or(header.layout),
            native_layout: header.layout,
            native_width,
            native_height,
            subsample: effective.subsample,
            subimage: header.subimage,
            tiles: TileLayout::new(
                width,
                height,
                self.options.tile_width,
                self.options.tile_height,
            ),
        };

        info!(
            source = source.identifier(),
            format,
            width,
            height,
            layout = ?info.layout,
            subimage = header.subimage,
            tiles = info.tiles.tile_count(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Constructed image"
        );

        Ok(RenderedImage::new(
            info,
            header,
            effective,
            source,
            decoder,
            self.options.tile_cache_bytes,
        ))
    }

    fn check_limits(&self, format: &'static str, header: &HeaderInfo) -> Result<(), ImageError> {
        let HeaderInfo { width, height, .. } = *header;

        if width == 0 || height == 0 {
            return Err(DecodeError::ZeroDimensions {
                format,
                width,
                height,
            }
            .into());
        }

        if width as u64 * height as u64 > self.options.max_pixels {
            return Err(DecodeError::TooLarge {
                format,
                width,
                height,
                max_pixels: self.options.max_pixels,
            }
            .into());
        }

        Ok(())
    }
}

#[async_trait]
impl ConstructionRoutine for ImageFactory {
    async fn build_subimage(
        &self,
        tag: &str,
        source: SharedSource,
        hints: Option<&DecodeHints>,
        subimage: Option<u32>,
    ) -> Result<RenderedImage, ImageError> {
        ImageFactory::build_subimage(self, tag, source, hints, subimage).await
    }
}
