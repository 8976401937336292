use std::fmt;

/// Built-in encoded image formats.
///
/// The registry is keyed by [`FormatTag::as_str`]; these six names are the
/// ones the standard registry and the static adapters know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FormatTag {
    Bmp,
    Fpx,
    Jpeg,
    Png,
    Pnm,
    Tiff,
}

impl FormatTag {
    /// Every built-in tag, in registry order.
    pub const ALL: [FormatTag; 6] = [
        FormatTag::Bmp,
        FormatTag::Fpx,
        FormatTag::Jpeg,
        FormatTag::Png,
        FormatTag::Pnm,
        FormatTag::Tiff,
    ];

    /// Registry key.
    pub const fn as_str(self) -> &'static str {
        match self {
            FormatTag::Bmp => "bmp",
            FormatTag::Fpx => "fpx",
            FormatTag::Jpeg => "jpeg",
            FormatTag::Png => "png",
            FormatTag::Pnm => "pnm",
            FormatTag::Tiff => "tiff",
        }
    }

    /// Human-readable format name.
    pub const fn description(self) -> &'static str {
        match self {
            FormatTag::Bmp => "Windows Bitmap",
            FormatTag::Fpx => "FlashPix",
            FormatTag::Jpeg => "JPEG",
            FormatTag::Png => "Portable Network Graphics",
            FormatTag::Pnm => "Portable Anymap",
            FormatTag::Tiff => "Tagged Image File Format",
        }
    }

    /// Whether a stream of this format can hold several images selectable by
    /// index: TIFF directories or FlashPix resolutions.
    pub const fn has_subimages(self) -> bool {
        matches!(self, FormatTag::Fpx | FormatTag::Tiff)
    }

    /// Parse a tag, accepting common aliases and any ASCII case.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "bmp" => Some(FormatTag::Bmp),
            "fpx" | "flashpix" => Some(FormatTag::Fpx),
            "jpeg" | "jpg" => Some(FormatTag::Jpeg),
            "png" => Some(FormatTag::Png),
            "pnm" | "pbm" | "pgm" | "ppm" | "pam" => Some(FormatTag::Pnm),
            "tiff" | "tif" => Some(FormatTag::Tiff),
            _ => None,
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
