//! Tile access: lazy decoding, caching and serialization per handle.

use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageBuffer, ImageFormat, Luma};
use raster_factory::{
    adapters, BuildOptions, DecodeHints, ErrorKind, ImageError, ImageFactory,
    MaterializationState, ParameterBundle, PixelLayout, SharedSource, TileCachePolicy,
};

use super::test_utils::{
    encode, encode_rgb, memory_source, patterned_rgb, pgm, png_1x1, SlowReader,
};

fn tiled(tile: u32) -> ImageFactory {
    ImageFactory::with_options(BuildOptions {
        tile_width: tile,
        tile_height: tile,
        ..BuildOptions::default()
    })
}

#[tokio::test]
async fn test_single_pixel_png() {
    let factory = ImageFactory::default();
    let bundle = ParameterBundle::from_source(memory_source(png_1x1([200, 100, 50]), "mem://1x1"));

    let image = adapters::PNG.create(&factory, &bundle, None).await.unwrap();
    let info = image.info();
    assert_eq!((info.width, info.height), (1, 1));
    assert_eq!(info.layout, PixelLayout::Rgb8);
    assert_eq!((info.tiles.tiles_x, info.tiles.tiles_y), (1, 1));
    assert_eq!(image.state().await, MaterializationState::Constructed);

    let tile = image.get_tile(0, 0).await.unwrap();
    assert_eq!((tile.x, tile.y, tile.width, tile.height), (0, 0, 1, 1));
    assert_eq!(tile.pixel(0, 0), Some(&[200u8, 100, 50][..]));
    assert_eq!(image.state().await, MaterializationState::FullyMaterialized);

    for (x, y) in [(1, 0), (0, 1)] {
        let err = image.get_tile(x, y).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TileOutOfBounds);
        assert!(matches!(
            err,
            ImageError::TileOutOfBounds {
                tiles_x: 1,
                tiles_y: 1,
                ..
            }
        ));
    }
}

/// Repeated requests return identical tiles without touching the stream.
#[tokio::test]
async fn test_tile_requests_are_idempotent() {
    let reader = memory_source(encode_rgb(40, 30, ImageFormat::Png), "mem://idem.png");
    let source: SharedSource = reader.clone();
    let image = tiled(16).build("png", source, None).await.unwrap();

    let first = image.get_tile(2, 1).await.unwrap();
    assert_eq!((first.x, first.y, first.width, first.height), (32, 16, 8, 14));
    let expected = patterned_rgb(40, 30).get_pixel(32, 16).0;
    assert_eq!(first.pixel(0, 0), Some(&expected[..]));

    reader.reset();
    let again = image.get_tile(2, 1).await.unwrap();
    assert_eq!(first, again);

    // Every other tile was cut from the same decode
    let other = image.get_tile(0, 0).await.unwrap();
    assert_eq!((other.width, other.height), (16, 16));

    assert_eq!(reader.read_count(), 0);
    assert_eq!(image.decode_count(), 1);
    assert_eq!(image.cached_tile_count().await, 6);
    assert_eq!(image.state().await, MaterializationState::FullyMaterialized);

    let stats = image.cache_stats().await;
    assert_eq!(stats.entries, 6);
    assert!(stats.hits >= 2);
}

/// Concurrent requests on one handle share a single decode.
#[tokio::test]
async fn test_concurrent_requests_decode_once() {
    let reader = Arc::new(SlowReader::new(
        encode_rgb(64, 64, ImageFormat::Png),
        Duration::from_millis(5),
    ));
    let source: SharedSource = reader.clone();
    let image = Arc::new(tiled(16).build("png", source, None).await.unwrap());

    let mut handles = Vec::new();
    for y in 0..4 {
        for x in 0..4 {
            let image = Arc::clone(&image);
            handles.push(tokio::spawn(async move { image.get_tile(x, y).await }));
        }
    }

    let source_pixels = patterned_rgb(64, 64);
    for handle in handles {
        let tile = handle.await.unwrap().unwrap();
        let expected = source_pixels.get_pixel(tile.x, tile.y).0;
        assert_eq!(tile.pixel(0, 0), Some(&expected[..]));
    }

    assert_eq!(image.decode_count(), 1);
    assert_eq!(reader.max_in_flight(), 1);
    assert_eq!(image.state().await, MaterializationState::FullyMaterialized);
}

#[tokio::test]
async fn test_small_cache_budget_is_partial() {
    // Four 16x16 gray tiles of 256 bytes; room for two
    let factory = ImageFactory::with_options(BuildOptions {
        tile_width: 16,
        tile_height: 16,
        tile_cache_bytes: 600,
        ..BuildOptions::default()
    });
    let source: SharedSource = memory_source(pgm(32, 32), "mem://small.pgm");
    let image = factory.build("pnm", source, None).await.unwrap();

    let tile = image.get_tile(0, 0).await.unwrap();
    assert_eq!(tile.pixel(1, 0), Some(&[1u8][..]));
    assert_eq!(image.state().await, MaterializationState::PartiallyMaterialized);
    assert!(image.cached_tile_count().await < 4);

    // The requested tile survives eviction
    image.get_tile(0, 0).await.unwrap();
    assert_eq!(image.decode_count(), 1);
}

#[tokio::test]
async fn test_discard_policy_never_caches() {
    let hints = DecodeHints::new().with_tile_cache(TileCachePolicy::Discard);
    let source: SharedSource = memory_source(encode_rgb(20, 20, ImageFormat::Png), "mem://d.png");
    let image = tiled(10).build("png", source, Some(&hints)).await.unwrap();

    let first = image.get_tile(1, 1).await.unwrap();
    let second = image.get_tile(1, 1).await.unwrap();
    assert_eq!(first, second);

    assert_eq!(image.decode_count(), 2);
    assert_eq!(image.cached_tile_count().await, 0);
    assert_eq!(image.state().await, MaterializationState::Constructed);
}

/// Hints that only some formats honor leave the ignoring formats' tiles
/// in their native layout.
#[tokio::test]
async fn test_color_hint_changes_tiles_only_where_honored() {
    let hints = DecodeHints::new().with_color(PixelLayout::Rgba8);

    let source: SharedSource = memory_source(encode_rgb(4, 4, ImageFormat::Png), "mem://c.png");
    let png = ImageFactory::default()
        .build("png", source, Some(&hints))
        .await
        .unwrap();
    let tile = png.get_tile(0, 0).await.unwrap();
    assert_eq!(tile.layout, PixelLayout::Rgba8);
    assert_eq!(tile.byte_len(), 4 * 4 * 4);
    assert_eq!(tile.pixel(3, 3).map(|p| p[3]), Some(255));

    let source: SharedSource = memory_source(encode_rgb(4, 4, ImageFormat::Bmp), "mem://c.bmp");
    let bmp = ImageFactory::default()
        .build("bmp", source, Some(&hints))
        .await
        .unwrap();
    let tile = bmp.get_tile(0, 0).await.unwrap();
    assert_eq!(tile.layout, PixelLayout::Rgb8);
    assert_eq!(tile.byte_len(), 4 * 4 * 3);
}

#[tokio::test]
async fn test_subsampled_tiles_keep_block_origins() {
    let hints = DecodeHints::new().with_subsample(2);
    let source: SharedSource = memory_source(encode_rgb(8, 8, ImageFormat::Tiff), "mem://s.tiff");
    let image = ImageFactory::default()
        .build("tiff", source, Some(&hints))
        .await
        .unwrap();

    let tile = image.get_tile(0, 0).await.unwrap();
    assert_eq!((tile.width, tile.height), (4, 4));

    let source_pixels = patterned_rgb(8, 8);
    for (x, y) in [(0, 0), (1, 1), (3, 2)] {
        let expected = source_pixels.get_pixel(x * 2, y * 2).0;
        assert_eq!(tile.pixel(x, y), Some(&expected[..]));
    }
}

#[tokio::test]
async fn test_sixteen_bit_samples_are_little_endian() {
    let img = DynamicImage::ImageLuma16(ImageBuffer::from_fn(3, 2, |x, y| {
        Luma([0x0102 * (x as u16 + 1) + 0x1000 * y as u16])
    }));
    let source: SharedSource = memory_source(encode(&img, ImageFormat::Png), "mem://g16.png");
    let image = ImageFactory::default().build("png", source, None).await.unwrap();
    assert_eq!(image.info().layout, PixelLayout::Gray16);

    let tile = image.get_tile(0, 0).await.unwrap();
    assert_eq!(tile.pixel(1, 1), Some(&0x1204u16.to_le_bytes()[..]));
}

/// A corrupt payload fails the request but leaves the handle usable.
#[tokio::test]
async fn test_corrupt_payload_is_decode_error() {
    let mut bytes = encode_rgb(32, 32, ImageFormat::Png);
    let len = bytes.len();
    bytes.truncate(len - 64);
    let source: SharedSource = memory_source(bytes, "mem://corrupt.png");

    let image = ImageFactory::default().build("png", source, None).await.unwrap();
    for _ in 0..2 {
        let err = image.get_tile(0, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    assert_eq!(image.decode_count(), 2);
    assert_eq!(image.state().await, MaterializationState::Constructed);
    assert_eq!(image.info().width, 32);
}
