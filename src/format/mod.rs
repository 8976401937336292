//! Encoded image formats.
//!
//! Each format contributes a [`FormatDecoder`]: a signature check, a bounded
//! header read, and a full pixel decode. The [`FormatRegistry`] maps tag
//! strings to decoders together with the hints each format honors.
//!
//! Supported formats:
//!
//! - **BMP**: Windows and OS/2 bitmaps
//! - **FPX**: FlashPix (metadata only; tile payloads are unsupported)
//! - **JPEG**: baseline and progressive
//! - **PNG**
//! - **PNM**: PBM, PGM, PPM and PAM
//! - **TIFF**: classic and BigTIFF

mod bmp;
pub(crate) mod decoder;
mod fpx;
mod hints;
mod jpeg;
mod png;
mod pnm;
mod registry;
mod tag;
mod tiff;

pub use bmp::BmpDecoder;
pub use decoder::{FormatDecoder, HeaderInfo};
pub use fpx::FpxDecoder;
pub use hints::{DecodeHints, EffectiveHints, HintSupport, TileCachePolicy};
pub use jpeg::JpegDecoder;
pub use png::PngDecoder;
pub use pnm::PnmDecoder;
pub use registry::{FormatEntry, FormatRegistry};
pub use tag::FormatTag;
pub use tiff::TiffDecoder;
