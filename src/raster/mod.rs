//! Rendered images and their pixel data.
//!
//! - [`ImageInfo`], [`PixelLayout`], [`TileLayout`]: metadata fixed at construction
//! - [`RenderedImage`]: the lazily materialized handle returned by the factory
//! - [`PixelBlock`]: one tile of decoded pixels
//! - [`TileCache`]: per-image LRU of materialized tiles

mod block;
mod info;
mod rendered;
mod tile_cache;

pub use block::PixelBlock;
pub use info::{ImageInfo, PixelLayout, TileLayout};
pub use rendered::{MaterializationState, RenderedImage};
pub use tile_cache::{CacheStats, TileCache, TileIndex, DEFAULT_TILE_CACHE_BYTES};
