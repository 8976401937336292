//! Netpbm header reader (PBM, PGM, PPM in plain and raw form, and PAM).
//!
//! The header is ASCII of unbounded length in theory; the header reader reads a
//! fixed window and rejects headers that do not fit in it.

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};

use crate::error::{DecodeError, ImageError};
use crate::io::{read_at_most, RangeReader};
use crate::raster::PixelLayout;

use super::decoder::{decode_with_image, invalid_header, FormatDecoder, HeaderInfo};

const FORMAT: &str = "pnm";

/// Maximum header bytes the header reader reads
const HEADER_WINDOW: usize = 1024;

/// Decoder for Netpbm streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct PnmDecoder;

#[async_trait]
impl FormatDecoder for PnmDecoder {
    fn name(&self) -> &'static str {
        FORMAT
    }

    fn signature_len(&self) -> usize {
        2
    }

    fn signature(&self) -> &'static str {
        "P1..P7"
    }

    fn matches_signature(&self, leading: &[u8]) -> bool {
        matches!(leading, [b'P', b'1'..=b'7', ..])
    }

    async fn read_header(&self, reader: &dyn RangeReader) -> Result<HeaderInfo, ImageError> {
        let window = read_at_most(reader, 0, HEADER_WINDOW).await?;
        let complete = (window.len() as u64) == reader.size();

        let parsed = match window.get(1) {
            Some(b'7') => parse_pam(&window),
            Some(&kind) => parse_netpbm(&window, kind),
            None => Err(HeaderFault::Incomplete),
        };

        match parsed {
            Ok(header) => Ok(header),
            Err(HeaderFault::Incomplete) if complete => Err(DecodeError::Truncated {
                format: FORMAT,
                required: window.len() as u64 + 1,
                actual: reader.size(),
            }
            .into()),
            Err(HeaderFault::Incomplete) => Err(invalid_header(
                FORMAT,
                format!("header longer than {HEADER_WINDOW} bytes"),
            )),
            Err(HeaderFault::Invalid(message)) => Err(invalid_header(FORMAT, message)),
        }
    }

    async fn decode_raster(
        &self,
        reader: &dyn RangeReader,
        _header: &HeaderInfo,
    ) -> Result<DynamicImage, ImageError> {
        decode_with_image(reader, FORMAT, ImageFormat::Pnm).await
    }
}

#[derive(Debug, PartialEq, Eq)]
enum HeaderFault {
    /// Ran out of bytes before the header ended
    Incomplete,
    Invalid(String),
}

/// Whitespace- and comment-separated decimal tokens.
struct Tokens<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    fn skip_separators(&mut self) {
        while let Some(&b) = self.bytes.get(self.pos) {
            if b == b'#' {
                while let Some(&c) = self.bytes.get(self.pos) {
                    if c == b'\n' || c == b'\r' {
                        break;
                    }
                    self.pos += 1;
                }
            } else if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn next_u32(&mut self, field: &str) -> Result<u32, HeaderFault> {
        self.skip_separators();
        let start = self.pos;
        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        // A number running to the end of the window may continue past it
        match self.bytes.get(self.pos) {
            None => return Err(HeaderFault::Incomplete),
            Some(b) if !b.is_ascii_whitespace() && *b != b'#' => {
                return Err(HeaderFault::Invalid(format!("malformed {field}")));
            }
            _ => {}
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| HeaderFault::Invalid(format!("malformed {field}")))
    }
}

fn parse_netpbm(window: &[u8], kind: u8) -> Result<HeaderInfo, HeaderFault> {
    let mut tokens = Tokens::new(window, 2);
    let width = tokens.next_u32("width")?;
    let height = tokens.next_u32("height")?;

    let layout = match kind {
        b'1' | b'4' => PixelLayout::Gray8,
        b'2' | b'5' | b'3' | b'6' => {
            let maxval = tokens.next_u32("maxval")?;
            if maxval == 0 || maxval > u16::MAX as u32 {
                return Err(HeaderFault::Invalid(format!("maxval {maxval} out of range")));
            }
            let depth = if maxval > 255 { 16 } else { 8 };
            let channels = if matches!(kind, b'3' | b'6') { 3 } else { 1 };
            PixelLayout::from_channels(channels, depth)
                .ok_or_else(|| HeaderFault::Invalid("unsupported layout".to_string()))?
        }
        other => {
            return Err(HeaderFault::Invalid(format!(
                "unknown magic P{}",
                other as char
            )))
        }
    };

    Ok(HeaderInfo::new(width, height, layout))
}

/// PAM (P7) header: `KEY value` lines terminated by `ENDHDR`.
fn parse_pam(window: &[u8]) -> Result<HeaderInfo, HeaderFault> {
    let text = String::from_utf8_lossy(window);
    let mut lines = text.split('\n').skip(1).peekable();

    let (mut width, mut height, mut depth, mut maxval) = (None, None, None, None);

    loop {
        let Some(line) = lines.next() else {
            return Err(HeaderFault::Incomplete);
        };
        // The last fragment has no newline yet and may be cut short
        if lines.peek().is_none() {
            return Err(HeaderFault::Incomplete);
        }

        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let number = || -> Result<u32, HeaderFault> {
            value
                .trim()
                .parse()
                .map_err(|_| HeaderFault::Invalid(format!("malformed {key}")))
        };

        match key {
            "WIDTH" => width = Some(number()?),
            "HEIGHT" => height = Some(number()?),
            "DEPTH" => depth = Some(number()?),
            "MAXVAL" => maxval = Some(number()?),
            "TUPLTYPE" => {}
            "ENDHDR" => break,
            other => return Err(HeaderFault::Invalid(format!("unknown PAM key {other}"))),
        }
    }

    let missing = |name: &str| HeaderFault::Invalid(format!("missing {name}"));
    let width = width.ok_or_else(|| missing("WIDTH"))?;
    let height = height.ok_or_else(|| missing("HEIGHT"))?;
    let depth = depth.ok_or_else(|| missing("DEPTH"))?;
    let maxval = maxval.ok_or_else(|| missing("MAXVAL"))?;

    if maxval == 0 || maxval > u16::MAX as u32 {
        return Err(HeaderFault::Invalid(format!("maxval {maxval} out of range")));
    }

    let bits = if maxval > 255 { 16 } else { 8 };
    let layout = u16::try_from(depth)
        .ok()
        .and_then(|d| PixelLayout::from_channels(d, bits))
        .ok_or_else(|| HeaderFault::Invalid(format!("unsupported depth {depth}")))?;

    Ok(HeaderInfo::new(width, height, layout))
}
