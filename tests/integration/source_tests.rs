//! Stream sources: local files, caller-owned streams and the block cache.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use image::ImageFormat;
use raster_factory::{
    adapters, BlockCache, ErrorKind, ImageError, ImageFactory, IoError, ParameterBundle,
    SeekableReader, SharedSource,
};

use super::test_utils::{encode_rgb, memory_source, patterned_rgb, pgm};

#[tokio::test]
async fn test_file_source_end_to_end() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&encode_rgb(30, 20, ImageFormat::Jpeg)).unwrap();
    file.flush().unwrap();

    let source: SharedSource = Arc::new(SeekableReader::open(file.path()).unwrap());
    let bundle = ParameterBundle::from_source(source);
    let image = adapters::JPEG
        .create(&ImageFactory::default(), &bundle, None)
        .await
        .unwrap();

    assert_eq!(image.source_id(), file.path().display().to_string());
    assert_eq!((image.info().width, image.info().height), (30, 20));

    let tile = image.get_tile(0, 0).await.unwrap();
    assert_eq!((tile.width, tile.height), (30, 20));
    assert_eq!(tile.byte_len(), 30 * 20 * 3);
}

/// The caller keeps using its stream afterwards: its position is unchanged.
#[tokio::test]
async fn test_caller_stream_position_is_preserved() {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&encode_rgb(12, 12, ImageFormat::Png)).unwrap();
    file.seek(SeekFrom::Start(7)).unwrap();

    let reader = Arc::new(SeekableReader::new(file, "file://caller.png").unwrap());
    let source: SharedSource = reader.clone();
    let bundle = ParameterBundle::from_source(source);

    let image = adapters::PNG
        .create(&ImageFactory::default(), &bundle, None)
        .await
        .unwrap();
    let tile = image.get_tile(0, 0).await.unwrap();
    let expected = patterned_rgb(12, 12).get_pixel(5, 5).0;
    assert_eq!(tile.pixel(5, 5), Some(&expected[..]));

    drop(image);
    drop(bundle);
    let Ok(reader) = Arc::try_unwrap(reader) else {
        panic!("source still shared");
    };
    let mut file: File = reader.into_inner().unwrap();
    assert_eq!(file.stream_position().unwrap(), 7);
}

#[tokio::test]
async fn test_missing_file_is_input_error() {
    let err = SeekableReader::open("/nonexistent/raster-factory/scan.bmp").unwrap_err();
    let err: ImageError = err.into();
    assert_eq!(err.kind(), ErrorKind::Input);
    assert!(matches!(err, ImageError::Input(IoError::NotFound(_))));
}

/// Header reads and decodes go through a block cache, which absorbs
/// repeated reads of the same region.
#[tokio::test]
async fn test_block_cache_in_front_of_source() {
    let inner = memory_source(encode_rgb(128, 128, ImageFormat::Png), "mem://remote.png");
    let cache = Arc::new(BlockCache::with_capacity(inner.clone(), 4096, 64));
    let source: SharedSource = cache.clone();
    let factory = ImageFactory::default();

    let image = factory.build("png", source.clone(), None).await.unwrap();
    assert_eq!(inner.read_count(), 1);
    assert_eq!(cache.fetch_count(), 1);

    image.get_tile(0, 0).await.unwrap();
    let after_decode = inner.read_count();
    assert!(after_decode > 1);

    // A second image over the same cached source reads nothing new
    let again = factory.build("png", source, None).await.unwrap();
    again.get_tile(0, 0).await.unwrap();
    assert_eq!(inner.read_count(), after_decode);
    assert_eq!(again.source_id(), "mem://remote.png");
}

#[tokio::test]
async fn test_memory_source_shared_by_handles() {
    let source: SharedSource = memory_source(pgm(5, 5), "mem://shared.pgm");
    let factory = ImageFactory::default();

    let a = factory.build("pnm", source.clone(), None).await.unwrap();
    let b = factory.build("pnm", source.clone(), None).await.unwrap();
    drop(a);

    let tile = b.get_tile(0, 0).await.unwrap();
    assert_eq!(tile.pixel(4, 4), Some(&[24u8][..]));
    assert_eq!(Arc::strong_count(&source), 2);
}
