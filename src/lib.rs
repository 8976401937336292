//! # Raster Factory
//!
//! Format-tagged factories that build lazily decoded, tile-addressable images
//! from seekable byte sources.
//!
//! A caller picks a format adapter (`bmp`, `fpx`, `jpeg`, `png`, `pnm`,
//! `tiff`), hands it a parameter bundle whose first entry is a stream source,
//! and gets back a [`RenderedImage`]. Construction only reads the stream header
//! header; pixels are decoded the first time a tile is requested.
//!
//! ## Architecture
//!
//! - [`io`] - Positional stream sources: memory, `Read + Seek`, S3, block cache
//! - [`mod@format`] - Format registry, header readers and decoding hints
//! - [`factory`] - The construction routine shared by every adapter
//! - [`raster`] - Rendered images, tiles and the per-image tile cache
//! - [`adapters`] - One entry point per format tag
//! - [`config`] - CLI configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use raster_factory::{adapters, ImageFactory, ParameterBundle, SeekableReader};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), raster_factory::ImageError> {
//!     let source = Arc::new(SeekableReader::open("scan.png")?);
//!     let factory = ImageFactory::default();
//!
//!     let image = adapters::PNG
//!         .create(&factory, &ParameterBundle::from_source(source), None)
//!         .await?;
//!     println!("{}x{}", image.info().width, image.info().height);
//!
//!     let tile = image.get_tile(0, 0).await?;
//!     println!("first tile holds {} bytes", tile.byte_len());
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod factory;
pub mod format;
pub mod io;
pub mod raster;

// Re-export commonly used types
pub use adapters::{adapter_for, BundleParam, FormatAdapter, ParameterBundle, ADAPTERS};
pub use config::{Cli, Command, FormatsConfig, InspectConfig};
pub use error::{DecodeError, ErrorKind, ImageError, IoError};
pub use factory::{
    BuildOptions, ConstructionRoutine, ImageFactory, DEFAULT_MAX_PIXELS, DEFAULT_TILE_SIZE,
};
pub use format::{
    DecodeHints, EffectiveHints, FormatDecoder, FormatEntry, FormatRegistry, FormatTag,
    HeaderInfo, HintSupport, TileCachePolicy,
};
pub use io::{
    create_s3_client, is_s3_uri, parse_s3_uri, read_at_most, BlockCache, MemoryRangeReader,
    RangeReader, S3RangeReader, SeekableReader, SharedSource,
};
pub use raster::{
    CacheStats, ImageInfo, MaterializationState, PixelBlock, PixelLayout, RenderedImage,
    TileLayout,
};
