//! Format registry: tag string to decoder capability.
//!
//! The registry is plain data. Each entry pairs a decoder with the table of
//! hints its format honors, so hint handling is decided by lookup rather
//! than by branching on the tag.
//!
//! # Example
//!
//! ```ignore
//! use raster_factory::format::FormatRegistry;
//!
//! let registry = FormatRegistry::standard();
//! let entry = registry.lookup("png")?;
//! assert!(entry.hint_support.subsample);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ImageError;

use super::bmp::BmpDecoder;
use super::decoder::FormatDecoder;
use super::fpx::FpxDecoder;
use super::hints::HintSupport;
use super::jpeg::JpegDecoder;
use super::png::PngDecoder;
use super::pnm::PnmDecoder;
use super::tag::FormatTag;
use super::tiff::TiffDecoder;

// =============================================================================
// FormatEntry
// =============================================================================

/// One registered format.
#[derive(Clone)]
pub struct FormatEntry {
    /// Registry key, lowercase
    pub name: &'static str,

    /// Hints this format's decode path consults
    pub hint_support: HintSupport,

    pub decoder: Arc<dyn FormatDecoder>,
}

impl fmt::Debug for FormatEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatEntry")
            .field("name", &self.name)
            .field("hint_support", &self.hint_support)
            .field("signature", &self.decoder.signature())
            .finish()
    }
}

// =============================================================================
// FormatRegistry
// =============================================================================

/// Mapping from format tag to decoder.
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    entries: BTreeMap<&'static str, FormatEntry>,
}

impl FormatRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The six built-in formats.
    ///
    /// TIFF and PNG honor every hint; BMP, FPX, JPEG and PNM ignore hints.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for tag in FormatTag::ALL {
            let (hint_support, decoder): (HintSupport, Arc<dyn FormatDecoder>) = match tag {
                FormatTag::Bmp => (HintSupport::NONE, Arc::new(BmpDecoder)),
                FormatTag::Fpx => (HintSupport::NONE, Arc::new(FpxDecoder)),
                FormatTag::Jpeg => (HintSupport::NONE, Arc::new(JpegDecoder)),
                FormatTag::Png => (HintSupport::ALL, Arc::new(PngDecoder)),
                FormatTag::Pnm => (HintSupport::NONE, Arc::new(PnmDecoder)),
                FormatTag::Tiff => (HintSupport::ALL, Arc::new(TiffDecoder)),
            };
            registry.register(tag.as_str(), hint_support, decoder);
        }
        registry
    }

    /// Add a format, replacing any entry under the same name.
    ///
    /// Names are stored as given and matched case-insensitively, so callers
    /// should register lowercase names.
    pub fn register(
        &mut self,
        name: &'static str,
        hint_support: HintSupport,
        decoder: Arc<dyn FormatDecoder>,
    ) {
        self.entries.insert(
            name,
            FormatEntry {
                name,
                hint_support,
                decoder,
            },
        );
    }

    /// Resolve a tag.
    pub fn lookup(&self, tag: &str) -> Result<&FormatEntry, ImageError> {
        self.entries
            .get(tag)
            .or_else(|| {
                self.entries
                    .values()
                    .find(|entry| entry.name.eq_ignore_ascii_case(tag))
            })
            .ok_or_else(|| ImageError::UnsupportedFormat {
                tag: tag.to_string(),
            })
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.lookup(tag).is_ok()
    }

    /// Entries in name order.
    pub fn entries(&self) -> impl Iterator<Item = &FormatEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Longest signature of any registered format.
    pub fn max_signature_len(&self) -> usize {
        self.entries
            .values()
            .map(|entry| entry.decoder.signature_len())
            .max()
            .unwrap_or(0)
    }

    /// Find the format whose signature matches `leading`.
    ///
    /// Used when a caller has a stream but no tag. Returns the first match in
    /// name order; the built-in signatures do not overlap.
    pub fn detect(&self, leading: &[u8]) -> Option<&FormatEntry> {
        self.entries.values().find(|entry| {
            leading.len() >= entry.decoder.signature_len()
                && entry.decoder.matches_signature(leading)
        })
    }
}
