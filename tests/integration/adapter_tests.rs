//! Format adapters delegating to the construction routine.

use std::sync::Arc;

use image::ImageFormat;
use raster_factory::{
    adapter_for, adapters, BundleParam, DecodeError, DecodeHints, ErrorKind, ImageError,
    ImageFactory, IoError, ParameterBundle, PixelLayout, SharedSource, ADAPTERS,
};

use super::test_utils::{
    compound_file_stub, encode_rgb, memory_source, pgm, png_1x1, RecordingRoutine,
};

/// Every adapter hands its own tag and the bundle's source to the routine.
#[tokio::test]
async fn test_each_adapter_delegates_with_its_tag() {
    let routine = RecordingRoutine::new();
    let hints = DecodeHints::new().with_subsample(2);

    for adapter in ADAPTERS {
        let id = format!("mem://{}", adapter.tag());
        let source: SharedSource = memory_source(png_1x1([1, 2, 3]), &id);
        let bundle = ParameterBundle::from_source(source);

        // Only the png adapter matches these bytes; the delegation is what matters
        let _ = adapter.create(&routine, &bundle, Some(&hints)).await;
    }

    let calls = routine.calls();
    assert_eq!(calls.len(), 6);
    for (call, adapter) in calls.iter().zip(ADAPTERS) {
        assert_eq!(call.tag, adapter.tag().as_str());
        assert_eq!(call.source_id, format!("mem://{}", adapter.tag()));
        assert_eq!(call.hints.as_ref(), Some(&hints));
        assert_eq!(call.subimage, None);
    }
}

#[tokio::test]
async fn test_hints_absent_are_forwarded_as_absent() {
    let routine = RecordingRoutine::new();
    let bundle = ParameterBundle::from_source(memory_source(pgm(4, 4), "mem://a.pgm"));

    adapters::PNM.create(&routine, &bundle, None).await.unwrap();
    assert_eq!(routine.calls()[0].hints, None);
}

/// A bundle without a source fails the same way for every adapter, before
/// the routine is reached.
#[tokio::test]
async fn test_bad_bundle_fails_uniformly() {
    let routine = RecordingRoutine::new();
    let bundles = [
        ParameterBundle::new(),
        ParameterBundle::new().with(BundleParam::Text("scan.png".to_string())),
        ParameterBundle::new()
            .with(BundleParam::Float(1.5))
            .with(BundleParam::Source(memory_source(pgm(1, 1), "mem://late"))),
    ];

    for bundle in &bundles {
        let kinds: Vec<ErrorKind> = error_kinds(&routine, bundle).await;
        assert!(kinds.iter().all(|k| *k == ErrorKind::Input), "{kinds:?}");
    }
    assert!(routine.calls().is_empty());
}

async fn error_kinds(routine: &RecordingRoutine, bundle: &ParameterBundle) -> Vec<ErrorKind> {
    let mut kinds = Vec::new();
    for adapter in ADAPTERS {
        let err = adapter.create(routine, bundle, None).await.unwrap_err();
        assert!(matches!(
            err,
            ImageError::Input(IoError::MissingSource { position: 0, .. })
        ));
        kinds.push(err.kind());
    }
    kinds
}

#[tokio::test]
async fn test_jpeg_adapter_over_png_bytes() {
    let factory = ImageFactory::default();
    let bundle = ParameterBundle::from_source(memory_source(png_1x1([9, 9, 9]), "mem://x"));

    let err = adapters::JPEG.create(&factory, &bundle, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert!(matches!(
        err,
        ImageError::Decode(DecodeError::SignatureMismatch { format: "jpeg", .. })
    ));
}

/// Each adapter accepts its own format and rejects the others' bytes.
#[tokio::test]
async fn test_adapters_match_their_formats() {
    let factory = ImageFactory::default();
    let fixtures = [
        ("bmp", encode_rgb(6, 5, ImageFormat::Bmp)),
        ("jpeg", encode_rgb(6, 5, ImageFormat::Jpeg)),
        ("png", encode_rgb(6, 5, ImageFormat::Png)),
        ("pnm", pgm(6, 5)),
        ("tiff", encode_rgb(6, 5, ImageFormat::Tiff)),
    ];

    for (tag, bytes) in &fixtures {
        let adapter = adapter_for(tag).unwrap();
        for (other, other_bytes) in &fixtures {
            let bundle = ParameterBundle::from_source(memory_source(other_bytes.clone(), other));
            let result = adapter.create(&factory, &bundle, None).await;

            if tag == other {
                let image = result.unwrap();
                assert_eq!(image.format(), *tag);
                assert_eq!((image.info().width, image.info().height), (6, 5));
            } else {
                assert_eq!(result.unwrap_err().kind(), ErrorKind::Decode, "{tag} over {other}");
            }
        }
    }
}

#[tokio::test]
async fn test_fpx_adapter_validates_compound_file() {
    let factory = ImageFactory::default();

    let bundle = ParameterBundle::from_source(memory_source(compound_file_stub(), "mem://a.fpx"));
    let err = adapters::FPX.create(&factory, &bundle, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);

    let bundle = ParameterBundle::from_source(memory_source(pgm(2, 2), "mem://b.fpx"));
    let err = adapters::FPX.create(&factory, &bundle, None).await.unwrap_err();
    assert!(matches!(
        err,
        ImageError::Decode(DecodeError::SignatureMismatch { format: "fpx", .. })
    ));
}

/// Extra bundle positions are format-specific and ignored by the routine.
#[tokio::test]
async fn test_trailing_parameters_are_ignored() {
    let factory = ImageFactory::default();
    let source: SharedSource = Arc::new(raster_factory::MemoryRangeReader::new(
        pgm(3, 2),
        "mem://c.pgm",
    ));
    let bundle = ParameterBundle::from_source(source)
        .with(BundleParam::Int(7))
        .with(BundleParam::Bytes(bytes::Bytes::from_static(b"\x00\x01")));
    assert_eq!(bundle.len(), 3);

    let image = adapters::PNM.create(&factory, &bundle, None).await.unwrap();
    assert_eq!(image.info().layout, PixelLayout::Gray8);
}

#[tokio::test]
async fn test_subimage_index_forwarded_for_tiff_and_fpx() {
    let routine = RecordingRoutine::new();

    for adapter in ADAPTERS {
        let id = format!("mem://{}", adapter.tag());
        let bundle = ParameterBundle::from_source(memory_source(pgm(2, 2), &id))
            .with(BundleParam::Int(2));
        let _ = adapter.create(&routine, &bundle, None).await;
    }

    let forwarded: Vec<(String, Option<u32>)> = routine
        .calls()
        .into_iter()
        .map(|call| (call.tag, call.subimage))
        .collect();
    assert_eq!(
        forwarded,
        [
            ("bmp".to_string(), None),
            ("fpx".to_string(), Some(2)),
            ("jpeg".to_string(), None),
            ("png".to_string(), None),
            ("pnm".to_string(), None),
            ("tiff".to_string(), Some(2)),
        ]
    );
}

#[tokio::test]
async fn test_malformed_subimage_index_stops_before_routine() {
    let routine = RecordingRoutine::new();
    let bundle = ParameterBundle::from_source(memory_source(pgm(2, 2), "mem://a.tif"))
        .with(BundleParam::Text("1".into()));

    let err = adapters::TIFF.create(&routine, &bundle, None).await.unwrap_err();
    assert!(matches!(
        err,
        ImageError::Input(IoError::InvalidParameter { position: 1, .. })
    ));
    assert!(routine.calls().is_empty());
}
