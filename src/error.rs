use thiserror::Error;

/// I/O errors that can occur when reading slide files
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// A file could not be opened
    #[error("Failed to open {path}: {message}")]
    Open { path: String, message: String },

    /// A positioned read failed
    #[error("Read failed on {path} at offset {offset}: {message}")]
    Read {
        path: String,
        offset: u64,
        message: String,
    },

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// A directory could not be listed
    #[error("Failed to list directory {path}: {message}")]
    ListDir { path: String, message: String },

    /// A file could not be written
    #[error("Failed to write {path}: {message}")]
    Write { path: String, message: String },
}

/// Errors raised when input files do not have the expected structure.
///
/// A detection failure for one backend is reported with one of these so the
/// caller can move on to the next backend.
#[derive(Debug, Clone, Error)]
pub enum FormatError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// File format is not supported by this backend
    #[error("Unsupported format: {reason}")]
    UnsupportedFormat { reason: String },

    /// The JPEG stream is malformed or uses an unsupported process
    #[error("Invalid JPEG stream: {0}")]
    InvalidJpeg(String),

    /// A required field is missing
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field is present but holds an unusable value
    #[error("Invalid value for {field}: {message}")]
    InvalidField { field: String, message: String },

    /// Tiles of a pyramid level are not square
    #[error("Non-square tiles: {width}x{height}")]
    NonSquareTiles { width: u32, height: u32 },

    /// Tile sources were not supplied in (level, row, column) order
    #[error(
        "Tile coordinate ({level}, {col}, {row}) does not follow ({prev_level}, {prev_col}, {prev_row})"
    )]
    CoordinateOrder {
        prev_level: i64,
        prev_col: i64,
        prev_row: i64,
        level: i64,
        col: i64,
        row: i64,
    },

    /// Tile geometry is inconsistent across sources
    #[error("Inconsistent geometry: {0}")]
    Geometry(String),

    /// No pyramid level survived filtering
    #[error("Couldn't find any tiles")]
    NoTiles,

    /// The file the caller asked for is not a valid member of its slide
    #[error("Requested file is not a valid slide member: {0}")]
    RequestedFileRejected(String),

    /// The DICOM parser rejected the file
    #[error("DICOM error: {0}")]
    Dicom(String),

    /// A VMS key file could not be parsed
    #[error("Key file error at line {line}: {message}")]
    KeyFile { line: usize, message: String },

    /// An offset hint file could not be parsed
    #[error("Hint file error: {0}")]
    HintFile(String),
}

/// Errors raised by the JPEG decoder
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// The codec rejected the byte range
    #[error("JPEG decode failed: {message}")]
    Jpeg { message: String },

    /// The decoded image does not have the expected size
    #[error("Decoded size {actual_width}x{actual_height} does not match expected {expected_width}x{expected_height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },
}

/// Errors surfaced by slide operations
#[derive(Debug, Clone, Error)]
pub enum SlideError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Structural error in the slide files
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Tile decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Requested level doesn't exist
    #[error("Invalid level {level}: slide has {level_count} levels")]
    InvalidLevel { level: usize, level_count: usize },

    /// A restart unit could not be located before the end of the stream
    #[error("Tile unavailable: unit {unit} of source {source_index} is past the end of the stream")]
    TileUnavailable { source_index: usize, unit: usize },

    /// Output buffer cannot hold the requested region
    #[error("Destination buffer too small: need {required} pixels, got {actual}")]
    BufferTooSmall { required: usize, actual: usize },

    /// Associated image name is unknown
    #[error("Associated image not found: {0}")]
    AssociatedImageNotFound(String),

    /// The operation is not supported by this slide's backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Errors returned by the async region service
#[derive(Debug, Clone, Error)]
pub enum RegionError {
    /// Request parameters are out of range
    #[error("Invalid region request: {0}")]
    InvalidRequest(String),

    /// Requested level doesn't exist
    #[error("Invalid level {level}: slide has {level_count} levels")]
    InvalidLevel { level: usize, level_count: usize },

    /// The slide failed to produce the region
    #[error(transparent)]
    Slide(#[from] SlideError),

    /// The blocking read task was cancelled or panicked
    #[error("Region task failed: {0}")]
    TaskFailed(String),
}
