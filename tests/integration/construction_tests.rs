//! Construction: validation, bounded header reads and hint resolution.

use std::sync::Arc;

use image::ImageFormat;
use raster_factory::{
    BuildOptions, DecodeError, DecodeHints, EffectiveHints, ErrorKind, ImageError, ImageFactory,
    MaterializationState, PixelLayout, RangeReader, SharedSource, TileCachePolicy,
};

use super::test_utils::{encode_rgb, memory_source, pgm, CountingReader};

fn find(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap()
}

async fn build_counted(tag: &str, bytes: Vec<u8>) -> (Arc<CountingReader>, u64) {
    let reader = memory_source(bytes, &format!("mem://header.{tag}"));
    let source: SharedSource = reader.clone();
    let image = ImageFactory::default().build(tag, source, None).await.unwrap();
    assert_eq!(image.decode_count(), 0);
    let size = reader.size();
    (reader, size)
}

/// Construction reads a few header structures, never the payload.
#[tokio::test]
async fn test_build_reads_only_headers() {
    let fixtures = [
        ("bmp", encode_rgb(128, 128, ImageFormat::Bmp)),
        ("jpeg", encode_rgb(128, 128, ImageFormat::Jpeg)),
        ("png", encode_rgb(128, 128, ImageFormat::Png)),
        ("pnm", pgm(128, 128)),
        ("tiff", encode_rgb(128, 128, ImageFormat::Tiff)),
    ];

    for (tag, bytes) in fixtures {
        let (reader, size) = build_counted(tag, bytes).await;
        assert!(size > 8192, "{tag} fixture too small");
        assert!(
            reader.bytes_read() < 2048,
            "{tag} read {} of {size} bytes",
            reader.bytes_read()
        );
    }
}

#[tokio::test]
async fn test_png_header_read_stops_before_image_data() {
    let bytes = encode_rgb(64, 64, ImageFormat::Png);
    let idat_data = find(&bytes, b"IDAT") + 4;

    let (reader, _) = build_counted("png", bytes).await;
    assert!(reader.max_read_end() <= idat_data as u64);
}

#[tokio::test]
async fn test_jpeg_header_read_stops_before_scan() {
    let bytes = encode_rgb(64, 64, ImageFormat::Jpeg);
    let scan = find(&bytes, &[0xFF, 0xDA]);

    let (reader, _) = build_counted("jpeg", bytes).await;
    assert!(reader.max_read_end() <= scan as u64);
}

#[tokio::test]
async fn test_bmp_header_read_stops_at_pixel_offset() {
    let (reader, _) = build_counted("bmp", encode_rgb(64, 64, ImageFormat::Bmp)).await;
    assert!(reader.max_read_end() <= 54);
}

/// Metadata queries after construction perform no I/O.
#[tokio::test]
async fn test_metadata_access_does_not_read() {
    let reader = memory_source(encode_rgb(40, 30, ImageFormat::Png), "mem://meta.png");
    let source: SharedSource = reader.clone();
    let image = ImageFactory::default().build("png", source, None).await.unwrap();
    reader.reset();

    for _ in 0..3 {
        assert_eq!(image.info().width, 40);
        assert_eq!(image.metadata().height, 30);
        assert_eq!(image.format(), "png");
        assert_eq!(image.source_id(), "mem://meta.png");
        assert_eq!(image.hints(), &EffectiveHints::default());
        assert_eq!(image.state().await, MaterializationState::Constructed);
    }

    assert_eq!(reader.read_count(), 0);
}

#[tokio::test]
async fn test_unknown_tag_reads_nothing() {
    let reader = memory_source(encode_rgb(4, 4, ImageFormat::Png), "mem://a.gif");
    let source: SharedSource = reader.clone();

    let err = ImageFactory::default()
        .build("gif", source, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ImageError::UnsupportedFormat { ref tag } if tag == "gif"));
    assert_eq!(reader.read_count(), 0);
}

#[tokio::test]
async fn test_tag_lookup_ignores_case() {
    let source: SharedSource = memory_source(encode_rgb(4, 4, ImageFormat::Png), "mem://a.png");
    let image = ImageFactory::default().build("PNG", source, None).await.unwrap();
    assert_eq!(image.format(), "png");
}

#[tokio::test]
async fn test_truncated_stream() {
    let mut bytes = encode_rgb(16, 16, ImageFormat::Png);
    bytes.truncate(20);
    let source: SharedSource = memory_source(bytes, "mem://cut.png");

    let err = ImageFactory::default()
        .build("png", source, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ImageError::Decode(DecodeError::Truncated { format: "png", .. })
    ));
}

#[tokio::test]
async fn test_pixel_limit_is_checked_before_decode() {
    let factory = ImageFactory::with_options(BuildOptions {
        max_pixels: 1000,
        ..BuildOptions::default()
    });
    let source: SharedSource = memory_source(pgm(64, 64), "mem://big.pgm");

    let err = factory.build("pnm", source, None).await.unwrap_err();
    assert!(matches!(
        err,
        ImageError::Decode(DecodeError::TooLarge {
            width: 64,
            height: 64,
            max_pixels: 1000,
            ..
        })
    ));
}

/// PNG and TIFF honor hints; BMP, JPEG and PNM build as if none were given.
#[tokio::test]
async fn test_hints_honored_per_format() {
    let hints = DecodeHints::new()
        .with_color(PixelLayout::Gray8)
        .with_subsample(2)
        .with_tile_cache(TileCachePolicy::Discard);
    let factory = ImageFactory::default();

    for (tag, format) in [("png", ImageFormat::Png), ("tiff", ImageFormat::Tiff)] {
        let source: SharedSource = memory_source(encode_rgb(9, 6, format), tag);
        let image = factory.build(tag, source, Some(&hints)).await.unwrap();
        let info = image.info();

        assert_eq!((info.width, info.height), (5, 3), "{tag}");
        assert_eq!((info.native_width, info.native_height), (9, 6));
        assert_eq!(info.layout, PixelLayout::Gray8);
        assert_eq!(info.native_layout, PixelLayout::Rgb8);
        assert_eq!(image.hints().tile_cache, TileCachePolicy::Discard);
    }

    for (tag, format) in [("bmp", ImageFormat::Bmp), ("jpeg", ImageFormat::Jpeg)] {
        let source: SharedSource = memory_source(encode_rgb(9, 6, format), tag);
        let image = factory.build(tag, source, Some(&hints)).await.unwrap();
        let info = image.info();

        assert_eq!((info.width, info.height), (9, 6), "{tag}");
        assert_eq!(info.subsample, 1);
        assert_eq!(info.layout, PixelLayout::Rgb8);
        assert_eq!(image.hints(), &EffectiveHints::default());
    }

    let source: SharedSource = memory_source(pgm(9, 6), "pnm");
    let image = factory.build("pnm", source, Some(&hints)).await.unwrap();
    assert_eq!((image.info().width, image.info().height), (9, 6));
    assert_eq!(image.hints(), &EffectiveHints::default());
}

#[tokio::test]
async fn test_unknown_hint_keys_are_ignored() {
    let hints = DecodeHints::from_json(r#"{"subsample":3,"progressive":true}"#).unwrap();
    assert!(hints.extra.contains_key("progressive"));
    let source: SharedSource = memory_source(encode_rgb(9, 9, ImageFormat::Png), "mem://a.png");

    let image = ImageFactory::default()
        .build("png", source, Some(&hints))
        .await
        .unwrap();
    assert_eq!((image.info().width, image.info().height), (3, 3));
}

/// Builds share nothing: two handles over equal bytes are independent.
#[tokio::test]
async fn test_two_independent_tiff_builds() {
    let bytes = encode_rgb(20, 12, ImageFormat::Tiff);
    let first = memory_source(bytes.clone(), "mem://first.tiff");
    let second = memory_source(bytes, "mem://second.tiff");
    let factory = ImageFactory::with_options(BuildOptions {
        tile_width: 8,
        tile_height: 8,
        ..BuildOptions::default()
    });

    let (a, b) = tokio::join!(
        factory.build("tiff", first.clone(), None),
        factory.build("tiff", second.clone(), None)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.info(), b.info());
    assert_ne!(a.source_id(), b.source_id());

    second.reset();
    let tile = a.get_tile(1, 1).await.unwrap();
    assert_eq!((tile.width, tile.height), (8, 4));

    assert_eq!(a.decode_count(), 1);
    assert_eq!(b.decode_count(), 0);
    assert_eq!(b.state().await, MaterializationState::Constructed);
    assert_eq!(second.read_count(), 0);

    let other = b.get_tile(1, 1).await.unwrap();
    assert_eq!(tile.data, other.data);
}

/// A grid of 2^28 single-pixel tiles is laid out without allocating per tile.
#[tokio::test]
async fn test_huge_tile_grid_builds_cheaply() {
    let factory = ImageFactory::with_options(BuildOptions {
        tile_width: 1,
        tile_height: 1,
        ..BuildOptions::default()
    });
    let source: SharedSource = memory_source(b"P5\n16384 16384\n255\n".to_vec(), "mem://huge.pgm");

    let image = factory.build("pnm", source, None).await.unwrap();
    assert_eq!(image.info().tiles.tile_count(), 1 << 28);
    assert_eq!(image.cached_tile_count().await, 0);
    assert_eq!(image.cache_stats().await.entries, 0);
    assert_eq!(image.state().await, MaterializationState::Constructed);
}

#[tokio::test]
async fn test_zero_width_header_rejected() {
    let source: SharedSource = memory_source(b"P5\n0 4\n255\n".to_vec(), "mem://empty.pgm");
    let err = ImageFactory::default()
        .build("pnm", source, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert!(matches!(
        err,
        ImageError::Decode(DecodeError::ZeroDimensions { .. })
    ));
}
