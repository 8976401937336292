//! Raster Factory - inspect encoded images and materialize tiles.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use raster_factory::{
    adapter_for,
    config::{Cli, Command, FormatsConfig, InspectConfig},
    create_s3_client, is_s3_uri, read_at_most, BlockCache, FormatRegistry, ImageError,
    ImageFactory, RenderedImage, S3RangeReader, SeekableReader, SharedSource,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Inspect(config) => run_inspect(config).await,
        Command::Formats(config) => run_formats(config),
    }
}

// =============================================================================
// Inspect Command
// =============================================================================

async fn run_inspect(config: InspectConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let hints = match config.decode_hints() {
        Ok(hints) => hints,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let source = match open_source(&config).await {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to open {}: {}", config.source, e);
            return ExitCode::FAILURE;
        }
    };

    let factory = ImageFactory::with_options(config.build_options());

    let tag = match config.format.clone() {
        Some(tag) => tag,
        None => match detect_format(factory.registry(), &source).await {
            Ok(Some(tag)) => tag,
            Ok(None) => {
                error!("Could not detect the format of {}; pass --format", config.source);
                return ExitCode::FAILURE;
            }
            Err(e) => {
                error!("Failed to read {}: {}", config.source, e);
                return ExitCode::FAILURE;
            }
        },
    };

    let built = match adapter_for(&tag) {
        Some(adapter) => {
            let bundle = config.bundle(source);
            adapter.create(&factory, &bundle, hints.as_ref()).await
        }
        // Unregistered tags still go through the factory for its error
        None => {
            factory
                .build_subimage(&tag, source, hints.as_ref(), config.subimage)
                .await
        }
    };

    let image = match built {
        Ok(image) => image,
        Err(e) => {
            error!("Failed to build image: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut tiles = Vec::with_capacity(config.tiles.len());
    for &(x, y) in &config.tiles {
        tiles.push(tile_summary(&image, x, y).await);
    }

    let report = serde_json::json!({
        "source": image.source_id(),
        "info": image.info(),
        "hints": image.hints(),
        "tiles": tiles,
        "state": image.state().await,
        "decodes": image.decode_count(),
        "cache": image.cache_stats().await,
    });

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            error!("Failed to serialize report: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if tiles.iter().any(|tile| tile.get("error").is_some()) {
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Open a local file, or an S3 object behind a block cache.
async fn open_source(config: &InspectConfig) -> Result<SharedSource, ImageError> {
    if is_s3_uri(&config.source) {
        let client = create_s3_client(config.s3_endpoint.as_deref(), &config.s3_region).await;
        let reader = S3RangeReader::from_uri(client, &config.source).await?;
        debug!(
            block_size = config.block_size,
            blocks = config.cache_blocks,
            "Caching S3 source"
        );
        let cached =
            BlockCache::with_capacity(Arc::new(reader), config.block_size, config.cache_blocks);
        return Ok(Arc::new(cached));
    }

    Ok(Arc::new(SeekableReader::open(&config.source)?))
}

/// Name of the registered format whose signature matches the stream.
async fn detect_format(
    registry: &FormatRegistry,
    source: &SharedSource,
) -> Result<Option<String>, ImageError> {
    let leading = read_at_most(source.as_ref(), 0, registry.max_signature_len()).await?;
    let detected = registry.detect(&leading).map(|entry| entry.name.to_string());
    debug!(format = ?detected, "Detected format from signature");
    Ok(detected)
}

async fn tile_summary(image: &RenderedImage, x: u32, y: u32) -> serde_json::Value {
    match image.get_tile(x, y).await {
        Ok(block) => serde_json::json!({
            "tile_x": block.tile_x,
            "tile_y": block.tile_y,
            "x": block.x,
            "y": block.y,
            "width": block.width,
            "height": block.height,
            "layout": block.layout,
            "bytes": block.byte_len(),
        }),
        Err(e) => serde_json::json!({
            "tile_x": x,
            "tile_y": y,
            "error": e.to_string(),
        }),
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "raster_factory=debug"
    } else {
        "raster_factory=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// =============================================================================
// Formats Command
// =============================================================================

fn run_formats(config: FormatsConfig) -> ExitCode {
    let registry = FormatRegistry::standard();

    if config.json {
        let formats: Vec<_> = registry
            .entries()
            .map(|entry| {
                serde_json::json!({
                    "name": entry.name,
                    "signature": entry.decoder.signature(),
                    "hints": entry.hint_support,
                })
            })
            .collect();

        return match serde_json::to_string_pretty(&formats) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    println!(
        "{:<6} {:<24} {:<6} {:<10} {:<10}",
        "FORMAT", "SIGNATURE", "COLOR", "SUBSAMPLE", "TILE CACHE"
    );
    for entry in registry.entries() {
        let flag = |honored: bool| if honored { "yes" } else { "-" };
        println!(
            "{:<6} {:<24} {:<6} {:<10} {:<10}",
            entry.name,
            entry.decoder.signature(),
            flag(entry.hint_support.color),
            flag(entry.hint_support.subsample),
            flag(entry.hint_support.tile_cache),
        );
    }

    ExitCode::SUCCESS
}
