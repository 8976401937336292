use thiserror::Error;

/// I/O errors that can occur when reading from a stream source
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error from S3 or S3-compatible storage
    #[error("S3 error: {0}")]
    S3(String),

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Source location could not be parsed
    #[error("Invalid source URI: {0}")]
    InvalidUri(String),

    /// Read or seek failure on a local stream
    #[error("Read error on {source_id}: {message}")]
    Read { source_id: String, message: String },

    /// The parameter bundle does not carry a stream source at the expected position
    #[error("No stream source at bundle position {position}: found {found}")]
    MissingSource {
        position: usize,
        found: &'static str,
    },

    /// A format-specific bundle parameter has the wrong type or value
    #[error("Bundle position {position}: expected {expected}, found {found}")]
    InvalidParameter {
        position: usize,
        expected: &'static str,
        found: String,
    },
}

/// Errors raised when a stream does not conform to its declared format
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// Leading bytes do not carry the format's signature
    #[error("{format}: signature mismatch (expected {expected})")]
    SignatureMismatch {
        format: &'static str,
        expected: &'static str,
    },

    /// Stream ends before a structure the format requires
    #[error("{format}: stream truncated, need {required} bytes, have {actual}")]
    Truncated {
        format: &'static str,
        required: u64,
        actual: u64,
    },

    /// Header fields are present but invalid
    #[error("{format}: invalid header: {message}")]
    InvalidHeader {
        format: &'static str,
        message: String,
    },

    /// Header declares an empty image
    #[error("{format}: zero image dimensions ({width}x{height})")]
    ZeroDimensions {
        format: &'static str,
        width: u32,
        height: u32,
    },

    /// Image exceeds the configured pixel limit
    #[error("{format}: image of {width}x{height} exceeds the limit of {max_pixels} pixels")]
    TooLarge {
        format: &'static str,
        width: u32,
        height: u32,
        max_pixels: u64,
    },

    /// Decoded payload disagrees with the header read at construction
    #[error("{format}: decoded {actual_width}x{actual_height}, header declared {width}x{height}")]
    DimensionMismatch {
        format: &'static str,
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    /// Pixel payload could not be decoded
    #[error("{format}: payload decode failed: {message}")]
    Payload {
        format: &'static str,
        message: String,
    },

    /// A feature of the format has no decoding backend
    #[error("{format}: unsupported: {feature}")]
    Unsupported {
        format: &'static str,
        feature: String,
    },
}

/// Top-level error for image construction and tile access
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    /// No registry entry for the requested format tag
    #[error("Unsupported format: {tag}")]
    UnsupportedFormat { tag: String },

    /// The stream is unreadable, not seekable, or failed mid-read
    #[error("Input error: {0}")]
    Input(#[from] IoError),

    /// The stream does not conform to the declared format
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Tile coordinates outside the image's tile grid
    #[error("Tile ({x}, {y}) out of bounds (grid is {tiles_x}x{tiles_y})")]
    TileOutOfBounds {
        x: u32,
        y: u32,
        tiles_x: u32,
        tiles_y: u32,
    },
}

/// Coarse classification of an [`ImageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnsupportedFormat,
    Input,
    Decode,
    TileOutOfBounds,
}

impl ImageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImageError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            ImageError::Input(_) => ErrorKind::Input,
            ImageError::Decode(_) => ErrorKind::Decode,
            ImageError::TileOutOfBounds { .. } => ErrorKind::TileOutOfBounds,
        }
    }
}
