//! Per-format entry points.
//!
//! An adapter binds one format tag to the construction routine. It pulls the
//! stream source out of the caller's parameter bundle and delegates; errors
//! from the routine pass through unchanged.
//!
//! # Bundle positions
//!
//! | Position | Parameter | Formats |
//! |----------|-----------|---------|
//! | 0 | stream source (required) | all |
//! | 1 | `Int` subimage index, `-1` for the default | tiff, fpx |
//!
//! Other formats ignore every position after 0.
//!
//! # Example
//!
//! ```ignore
//! use raster_factory::{adapters, ImageFactory, ParameterBundle};
//!
//! let factory = ImageFactory::default();
//! let bundle = ParameterBundle::from_source(source);
//! let image = adapters::PNG.create(&factory, &bundle, None).await?;
//! ```

use bytes::Bytes;

use crate::error::{ImageError, IoError};
use crate::factory::ConstructionRoutine;
use crate::format::{DecodeHints, FormatTag};
use crate::io::SharedSource;
use crate::raster::RenderedImage;

// =============================================================================
// ParameterBundle
// =============================================================================

/// One typed input in a parameter bundle.
#[derive(Clone)]
pub enum BundleParam {
    Source(SharedSource),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
}

impl BundleParam {
    /// Name of the parameter's type, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            BundleParam::Source(_) => "stream source",
            BundleParam::Int(_) => "integer",
            BundleParam::Float(_) => "float",
            BundleParam::Text(_) => "text",
            BundleParam::Bytes(_) => "bytes",
        }
    }
}

impl std::fmt::Debug for BundleParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleParam::Source(source) => {
                f.debug_tuple("Source").field(&source.identifier()).finish()
            }
            BundleParam::Int(v) => f.debug_tuple("Int").field(v).finish(),
            BundleParam::Float(v) => f.debug_tuple("Float").field(v).finish(),
            BundleParam::Text(v) => f.debug_tuple("Text").field(v).finish(),
            BundleParam::Bytes(v) => f.debug_tuple("Bytes").field(&v.len()).finish(),
        }
    }
}

/// Ordered, heterogeneous inputs for an adapter.
///
/// Position 0 must hold the stream source; later positions are
/// format-specific and may be absent.
#[derive(Debug, Clone, Default)]
pub struct ParameterBundle {
    params: Vec<BundleParam>,
}

/// Bundle position of the stream source
pub const SOURCE_POSITION: usize = 0;

/// Bundle position of the TIFF directory or FlashPix resolution index
pub const SUBIMAGE_POSITION: usize = 1;

impl ParameterBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bundle holding only a stream source.
    pub fn from_source(source: SharedSource) -> Self {
        Self::new().with(BundleParam::Source(source))
    }

    /// Append a parameter.
    pub fn with(mut self, param: BundleParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn get(&self, position: usize) -> Option<&BundleParam> {
        self.params.get(position)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// The stream source at position 0.
    ///
    /// # Errors
    /// [`IoError::MissingSource`] when the bundle is empty or position 0 holds
    /// another kind of parameter.
    pub fn stream_source(&self) -> Result<SharedSource, ImageError> {
        match self.params.get(SOURCE_POSITION) {
            Some(BundleParam::Source(source)) => Ok(source.clone()),
            other => Err(IoError::MissingSource {
                position: SOURCE_POSITION,
                found: other.map_or("nothing", BundleParam::kind),
            }
            .into()),
        }
    }

    /// The subimage index at position 1.
    ///
    /// An absent parameter or `Int(-1)` selects the format's default image.
    ///
    /// # Errors
    /// [`IoError::InvalidParameter`] for other negative values and for
    /// parameters that are not integers.
    pub fn subimage_index(&self) -> Result<Option<u32>, ImageError> {
        let invalid = |found: String| -> ImageError {
            IoError::InvalidParameter {
                position: SUBIMAGE_POSITION,
                expected: "subimage index",
                found,
            }
            .into()
        };

        match self.params.get(SUBIMAGE_POSITION) {
            None | Some(BundleParam::Int(-1)) => Ok(None),
            Some(BundleParam::Int(index)) => u32::try_from(*index)
                .map(Some)
                .map_err(|_| invalid(index.to_string())),
            Some(other) => Err(invalid(other.kind().to_string())),
        }
    }
}

// =============================================================================
// FormatAdapter
// =============================================================================

/// Stateless binding of a format tag to the construction routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatAdapter {
    tag: FormatTag,
}

impl FormatAdapter {
    pub const fn new(tag: FormatTag) -> Self {
        Self { tag }
    }

    pub const fn tag(&self) -> FormatTag {
        self.tag
    }

    /// Build an image of this adapter's format.
    ///
    /// Hints are forwarded as given; whether they apply is decided by the
    /// routine's per-format table. TIFF and FlashPix adapters also forward
    /// the subimage index from position 1 when one is given.
    pub async fn create<C>(
        &self,
        routine: &C,
        bundle: &ParameterBundle,
        hints: Option<&DecodeHints>,
    ) -> Result<RenderedImage, ImageError>
    where
        C: ConstructionRoutine + ?Sized,
    {
        let source = bundle.stream_source()?;
        let tag = self.tag.as_str();

        if self.tag.has_subimages() {
            if let Some(index) = bundle.subimage_index()? {
                return routine.build_subimage(tag, source, hints, Some(index)).await;
            }
        }
        routine.build(tag, source, hints).await
    }
}

pub const BMP: FormatAdapter = FormatAdapter::new(FormatTag::Bmp);
pub const FPX: FormatAdapter = FormatAdapter::new(FormatTag::Fpx);
pub const JPEG: FormatAdapter = FormatAdapter::new(FormatTag::Jpeg);
pub const PNG: FormatAdapter = FormatAdapter::new(FormatTag::Png);
pub const PNM: FormatAdapter = FormatAdapter::new(FormatTag::Pnm);
pub const TIFF: FormatAdapter = FormatAdapter::new(FormatTag::Tiff);

/// Every built-in adapter.
pub const ADAPTERS: [FormatAdapter; 6] = [BMP, FPX, JPEG, PNG, PNM, TIFF];

/// Adapter for a tag string, accepting aliases such as `jpg` and `tif`.
pub fn adapter_for(tag: &str) -> Option<FormatAdapter> {
    FormatTag::parse(tag).map(FormatAdapter::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::factory::ImageFactory;
    use crate::io::MemoryRangeReader;
    use std::io::Cursor;
    use std::sync::Arc;
    use tiff::encoder::{colortype, TiffEncoder};

    fn pgm() -> SharedSource {
        Arc::new(MemoryRangeReader::new(
            b"P5\n2 2\n255\n\x00\x40\x80\xff".to_vec(),
            "mem://a.pgm",
        ))
    }

    #[test]
    fn test_adapter_table() {
        let tags: Vec<&str> = ADAPTERS.iter().map(|a| a.tag().as_str()).collect();
        assert_eq!(tags, ["bmp", "fpx", "jpeg", "png", "pnm", "tiff"]);
        assert_eq!(adapter_for("JPG"), Some(JPEG));
        assert_eq!(adapter_for("gif"), None);
    }

    #[test]
    fn test_stream_source_errors() {
        let err = ParameterBundle::new().stream_source().err().expect("expected error");
        assert!(matches!(
            err,
            ImageError::Input(IoError::MissingSource {
                position: 0,
                found: "nothing"
            })
        ));

        let bundle = ParameterBundle::new()
            .with(BundleParam::Int(3))
            .with(BundleParam::Source(pgm()));
        let err = bundle.stream_source().err().expect("expected error");
        assert!(matches!(
            err,
            ImageError::Input(IoError::MissingSource {
                found: "integer",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_create_through_factory() {
        let factory = ImageFactory::default();
        let bundle = ParameterBundle::from_source(pgm()).with(BundleParam::Text("extra".into()));

        let image = PNM.create(&factory, &bundle, None).await.unwrap();
        assert_eq!(image.format(), "pnm");
        assert_eq!((image.info().width, image.info().height), (2, 2));
    }

    #[tokio::test]
    async fn test_wrong_adapter_is_decode_error() {
        let factory = ImageFactory::default();
        let bundle = ParameterBundle::from_source(pgm());

        let err = TIFF.create(&factory, &bundle, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[tokio::test]
    async fn test_dyn_routine() {
        let routine: Arc<dyn ConstructionRoutine> = Arc::new(ImageFactory::default());
        let bundle = ParameterBundle::from_source(pgm());
        let image = PNM.create(routine.as_ref(), &bundle, None).await.unwrap();
        assert_eq!(image.info().format, "pnm");
    }

    /// Directory 0 is 2x2 gray, directory 1 is 5x3 gray
    fn two_page_tiff() -> SharedSource {
        let mut out = Cursor::new(Vec::new());
        let mut encoder = TiffEncoder::new(&mut out).unwrap();
        encoder.write_image::<colortype::Gray8>(2, 2, &[0; 4]).unwrap();
        encoder.write_image::<colortype::Gray8>(5, 3, &[9; 15]).unwrap();
        Arc::new(MemoryRangeReader::new(out.into_inner(), "mem://pages.tif"))
    }

    #[test]
    fn test_subimage_index_positions() {
        let with = |param: BundleParam| ParameterBundle::from_source(pgm()).with(param);

        assert_eq!(ParameterBundle::from_source(pgm()).subimage_index().unwrap(), None);
        assert_eq!(with(BundleParam::Int(-1)).subimage_index().unwrap(), None);
        assert_eq!(with(BundleParam::Int(3)).subimage_index().unwrap(), Some(3));

        let err = with(BundleParam::Int(-2)).subimage_index().unwrap_err();
        assert!(matches!(
            err,
            ImageError::Input(IoError::InvalidParameter { position: 1, .. })
        ));
        assert!(err.to_string().contains("found -2"));

        let err = with(BundleParam::Float(1.0)).subimage_index().unwrap_err();
        assert!(err.to_string().contains("expected subimage index, found float"));

        let err = with(BundleParam::Int(i64::from(u32::MAX) + 1))
            .subimage_index()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[tokio::test]
    async fn test_tiff_directory_from_bundle() {
        let factory = ImageFactory::default();

        let bundle = ParameterBundle::from_source(two_page_tiff()).with(BundleParam::Int(1));
        let image = TIFF.create(&factory, &bundle, None).await.unwrap();
        assert_eq!((image.info().width, image.info().height), (5, 3));
        assert_eq!(image.info().subimage, 1);

        let tile = image.get_tile(0, 0).await.unwrap();
        assert_eq!(tile.pixel(4, 2), Some(&[9][..]));

        let bundle = ParameterBundle::from_source(two_page_tiff()).with(BundleParam::Int(-1));
        let image = TIFF.create(&factory, &bundle, None).await.unwrap();
        assert_eq!((image.info().width, image.info().subimage), (2, 0));
    }

    #[tokio::test]
    async fn test_subimage_index_only_read_for_multi_image_formats() {
        let factory = ImageFactory::default();

        let bundle = ParameterBundle::from_source(two_page_tiff())
            .with(BundleParam::Text("first".into()));
        let err = TIFF.create(&factory, &bundle, None).await.unwrap_err();
        assert!(matches!(
            err,
            ImageError::Input(IoError::InvalidParameter { .. })
        ));

        // PNM has one image per stream; position 1 is not consulted
        let bundle = ParameterBundle::from_source(pgm()).with(BundleParam::Int(5));
        let image = PNM.create(&factory, &bundle, None).await.unwrap();
        assert_eq!(image.info().subimage, 0);
    }
}
