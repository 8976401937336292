//! Command-line configuration for the `raster-factory` binary.
//!
//! Arguments are parsed with clap; every option of the `inspect` command can
//! also be set through an environment variable with the `RASTER_` prefix:
//!
//! - `RASTER_FORMAT` - Format tag (default: detected from the signature)
//! - `RASTER_HINTS` - Decoding hints as a JSON object
//! - `RASTER_SUBIMAGE` - TIFF directory or FlashPix resolution (default: the format's choice)
//! - `RASTER_TILE_SIZE` - Tile edge length in pixels (default: 256)
//! - `RASTER_CACHE_BYTES` - Tile cache budget per image (default: 64MB)
//! - `RASTER_MAX_PIXELS` - Largest accepted image (default: 2^28 pixels)
//! - `RASTER_BLOCK_SIZE` - Block size for S3 sources (default: 256KB)
//! - `RASTER_CACHE_BLOCKS` - Blocks kept for S3 sources (default: 64)
//! - `RASTER_S3_ENDPOINT` - Custom S3 endpoint for S3-compatible services
//! - `RASTER_S3_REGION` - AWS region (default: us-east-1)

use clap::{Args, Parser, Subcommand};

use crate::adapters::{BundleParam, ParameterBundle};
use crate::factory::{BuildOptions, DEFAULT_MAX_PIXELS, DEFAULT_TILE_SIZE};
use crate::format::DecodeHints;
use crate::io::{SharedSource, DEFAULT_BLOCK_CACHE_CAPACITY, DEFAULT_BLOCK_SIZE};
use crate::raster::DEFAULT_TILE_CACHE_BYTES;

// =============================================================================
// Default Values
// =============================================================================

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Largest accepted tile edge.
pub const MAX_TILE_SIZE: u32 = 8192;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Raster Factory - lazily decoded, tile-addressable images.
///
/// Probes an encoded image (BMP, FlashPix, JPEG, PNG, PNM or TIFF) from a
/// local file or an S3 object and decodes tiles on demand.
#[derive(Parser, Debug, Clone)]
#[command(name = "raster-factory")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build an image from a source and print its metadata and tiles as JSON.
    Inspect(InspectConfig),

    /// List the registered formats and the hints each one honors.
    Formats(FormatsConfig),
}

#[derive(Args, Debug, Clone)]
pub struct InspectConfig {
    /// Local path or `s3://bucket/key` URI of the encoded image.
    pub source: String,

    // =========================================================================
    // Decoding
    // =========================================================================
    /// Format tag (bmp, fpx, jpeg, png, pnm, tiff).
    ///
    /// Detected from the leading bytes when omitted.
    #[arg(long, env = "RASTER_FORMAT")]
    pub format: Option<String>,

    /// Decoding hints as a JSON object, e.g. `{"color":"gray8","subsample":2}`.
    #[arg(long, env = "RASTER_HINTS")]
    pub hints: Option<String>,

    /// TIFF directory or FlashPix resolution to open.
    ///
    /// TIFF defaults to the first directory, FlashPix to the highest
    /// resolution. Ignored by single-image formats.
    #[arg(long, env = "RASTER_SUBIMAGE")]
    pub subimage: Option<u32>,

    /// Tile to materialize, as `X,Y`. May be repeated.
    #[arg(long = "tile", value_parser = parse_tile_coord)]
    pub tiles: Vec<(u32, u32)>,

    // =========================================================================
    // Image Configuration
    // =========================================================================
    /// Tile edge length in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "RASTER_TILE_SIZE")]
    pub tile_size: u32,

    /// Tile cache budget per image in bytes.
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_BYTES, env = "RASTER_CACHE_BYTES")]
    pub cache_bytes: usize,

    /// Largest accepted `width * height`.
    #[arg(long, default_value_t = DEFAULT_MAX_PIXELS, env = "RASTER_MAX_PIXELS")]
    pub max_pixels: u64,

    // =========================================================================
    // S3 Configuration
    // =========================================================================
    /// Block size in bytes for the block cache in front of S3 sources.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE, env = "RASTER_BLOCK_SIZE")]
    pub block_size: usize,

    /// Number of blocks cached for S3 sources.
    #[arg(long, default_value_t = DEFAULT_BLOCK_CACHE_CAPACITY, env = "RASTER_CACHE_BLOCKS")]
    pub cache_blocks: usize,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    #[arg(long, env = "RASTER_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for S3.
    #[arg(long, default_value = DEFAULT_REGION, env = "RASTER_S3_REGION")]
    pub s3_region: String,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct FormatsConfig {
    /// Print the table as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

impl InspectConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("A source path or s3:// URI is required".to_string());
        }

        if self.tile_size == 0 || self.tile_size > MAX_TILE_SIZE {
            return Err(format!("tile_size must be between 1 and {MAX_TILE_SIZE}"));
        }
        if self.max_pixels == 0 {
            return Err("max_pixels must be greater than 0".to_string());
        }
        if self.cache_blocks == 0 {
            return Err("cache_blocks must be greater than 0".to_string());
        }
        if self.block_size < 1024 || self.block_size > 16 * 1024 * 1024 {
            return Err("block_size must be between 1KB and 16MB".to_string());
        }

        self.decode_hints()?;
        Ok(())
    }

    /// The parameter bundle handed to a format adapter.
    pub fn bundle(&self, source: SharedSource) -> ParameterBundle {
        let bundle = ParameterBundle::from_source(source);
        match self.subimage {
            Some(index) => bundle.with(BundleParam::Int(i64::from(index))),
            None => bundle,
        }
    }

    /// Parse `--hints`, if given.
    pub fn decode_hints(&self) -> Result<Option<DecodeHints>, String> {
        self.hints
            .as_deref()
            .map(|json| DecodeHints::from_json(json).map_err(|e| format!("Invalid hints: {e}")))
            .transpose()
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            tile_width: self.tile_size,
            tile_height: self.tile_size,
            tile_cache_bytes: self.cache_bytes,
            max_pixels: self.max_pixels,
        }
    }
}

/// Parse a tile coordinate written as `X,Y`.
pub fn parse_tile_coord(value: &str) -> Result<(u32, u32), String> {
    let (x, y) = value
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y but got '{value}'"))?;
    let x = x
        .trim()
        .parse()
        .map_err(|_| format!("invalid tile column '{x}'"))?;
    let y = y
        .trim()
        .parse()
        .map_err(|_| format!("invalid tile row '{y}'"))?;
    Ok((x, y))
}

// =============================================================================
// Tests
// =============================================================================
