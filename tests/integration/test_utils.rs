//! Test utilities for integration tests.
//!
//! Readers that record how a stream is accessed, a construction routine that
//! records what adapters hand it, and encoded image fixtures.

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use raster_factory::{
    ConstructionRoutine, DecodeHints, ImageError, ImageFactory, IoError, RangeReader,
    RenderedImage, SharedSource,
};

// =============================================================================
// Counting Range Reader
// =============================================================================

/// An in-memory reader that tracks every read request.
pub struct CountingReader {
    data: Bytes,
    identifier: String,
    reads: AtomicUsize,
    bytes_read: AtomicU64,
    max_end: AtomicU64,
}

impl CountingReader {
    pub fn new(data: Vec<u8>, identifier: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(data),
            identifier: identifier.into(),
            reads: AtomicUsize::new(0),
            bytes_read: AtomicU64::new(0),
            max_end: AtomicU64::new(0),
        }
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::SeqCst)
    }

    /// Furthest byte offset any read has reached.
    pub fn max_read_end(&self) -> u64 {
        self.max_end.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.bytes_read.store(0, Ordering::SeqCst);
        self.max_end.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl RangeReader for CountingReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        let end = offset + len as u64;
        if end > self.data.len() as u64 {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.data.len() as u64,
            });
        }

        self.bytes_read.fetch_add(len as u64, Ordering::SeqCst);
        self.max_end.fetch_max(end, Ordering::SeqCst);
        Ok(self.data.slice(offset as usize..end as usize))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// Slow Range Reader
// =============================================================================

/// A reader that sleeps on every read and tracks overlapping reads.
pub struct SlowReader {
    data: Bytes,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowReader {
    pub fn new(data: Vec<u8>, delay: Duration) -> Self {
        Self {
            data: Bytes::from(data),
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Largest number of reads observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RangeReader for SlowReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let end = offset as usize + len;
        if end > self.data.len() {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.data.len() as u64,
            });
        }
        Ok(self.data.slice(offset as usize..end))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        "mem://slow"
    }
}

// =============================================================================
// Recording Construction Routine
// =============================================================================

/// One call observed by [`RecordingRoutine`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub tag: String,
    pub source_id: String,
    pub hints: Option<DecodeHints>,
    pub subimage: Option<u32>,
}

/// Records every build request, then delegates to a real factory.
#[derive(Default)]
pub struct RecordingRoutine {
    factory: ImageFactory,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingRoutine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConstructionRoutine for RecordingRoutine {
    async fn build_subimage(
        &self,
        tag: &str,
        source: SharedSource,
        hints: Option<&DecodeHints>,
        subimage: Option<u32>,
    ) -> Result<RenderedImage, ImageError> {
        self.calls.lock().unwrap().push(RecordedCall {
            tag: tag.to_string(),
            source_id: source.identifier().to_string(),
            hints: hints.cloned(),
            subimage,
        });
        self.factory.build_subimage(tag, source, hints, subimage).await
    }
}

// =============================================================================
// Image Fixtures
// =============================================================================

/// RGB image whose pixels are a deterministic function of their position.
pub fn patterned_rgb(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let mut v = x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663);
        v ^= v >> 13;
        v = v.wrapping_mul(0x5bd1_e995);
        Rgb([(v & 0xFF) as u8, ((v >> 8) & 0xFF) as u8, ((v >> 16) & 0xFF) as u8])
    })
}

/// Encode an image with the `image` crate.
pub fn encode(img: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).unwrap();
    out.into_inner()
}

pub fn encode_rgb(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    encode(
        &DynamicImage::ImageRgb8(patterned_rgb(width, height)),
        format,
    )
}

/// A 1x1 PNG holding a single opaque pixel.
pub fn png_1x1(pixel: [u8; 3]) -> Vec<u8> {
    encode(
        &DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb(pixel))),
        ImageFormat::Png,
    )
}

/// A hand-written binary PGM whose sample at `(x, y)` is `y * width + x`.
pub fn pgm(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = format!("P5\n# fixture\n{width} {height}\n255\n").into_bytes();
    bytes.extend((0..width * height).map(|i| i as u8));
    bytes
}

/// An OLE compound-file signature followed by zeros.
pub fn compound_file_stub() -> Vec<u8> {
    let mut bytes = vec![0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
    bytes.resize(512, 0);
    bytes
}

pub fn memory_source(data: Vec<u8>, identifier: &str) -> Arc<CountingReader> {
    Arc::new(CountingReader::new(data, identifier))
}
