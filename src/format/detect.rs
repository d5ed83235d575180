//! Format detection for Whole Slide Image files.
//!
//! This module decides which backend should open a file. Currently supports:
//!
//! - **Tiled JPEG**: a `.vms` key file naming JPEG files with restart markers
//! - **DICOM WSI**: a DICOM Part 10 file, identified by the `DICM` magic at
//!   offset 128
//!
//! Callers pass a [`ContainerHint`] describing whether the file already
//! parsed as a tagged (TIFF-like) container. Such files are never DICOM.

use std::path::Path;

use crate::error::FormatError;
use crate::io::{LocalFileReader, RangeReader};

// =============================================================================
// SlideFormat
// =============================================================================

/// Detected slide format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideFormat {
    /// JPEG files placed on a grid by a `.vms` key file
    TiledJpeg,

    /// VL Whole Slide Microscopy series, one file per level
    Dicom,
}

impl SlideFormat {
    /// Get a human-readable name for the format.
    pub const fn name(&self) -> &'static str {
        match self {
            SlideFormat::TiledJpeg => "Tiled JPEG (VMS)",
            SlideFormat::Dicom => "DICOM WSI",
        }
    }

    /// Vendor string reported in the `wsi.vendor` property.
    pub const fn vendor(&self) -> &'static str {
        match self {
            SlideFormat::TiledJpeg => "hamamatsu",
            SlideFormat::Dicom => "dicom",
        }
    }
}

/// What is already known about the file's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerHint {
    /// The file parses as a TIFF-like tagged container
    TaggedContainer,

    /// Nothing known
    Unknown,
}

// =============================================================================
// Format Detection
// =============================================================================

/// Offset of the DICOM magic, after the 128-byte preamble.
const DICOM_MAGIC_OFFSET: usize = 128;

/// DICOM Part 10 magic.
const DICOM_MAGIC: &[u8; 4] = b"DICM";

/// TIFF header size (magic + version + first IFD offset).
const TIFF_HEADER_SIZE: usize = 8;

/// Extension of tiled JPEG key files.
const KEY_FILE_EXTENSION: &str = "vms";

/// Detect the format of a slide file.
///
/// # Format Detection Logic
///
/// 1. A `.vms` extension selects the tiled JPEG backend
/// 2. A tagged container is rejected for DICOM
/// 3. The `DICM` magic at offset 128 selects the DICOM backend
pub fn detect_format(path: &Path, hint: ContainerHint) -> Result<SlideFormat, FormatError> {
    let is_key_file = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(KEY_FILE_EXTENSION));
    if is_key_file {
        return Ok(SlideFormat::TiledJpeg);
    }

    if hint == ContainerHint::TaggedContainer {
        return Err(FormatError::UnsupportedFormat {
            reason: "Tagged container files are not DICOM".to_string(),
        });
    }

    let reader = LocalFileReader::open(path)?;
    let len = (DICOM_MAGIC_OFFSET + DICOM_MAGIC.len()) as u64;
    if reader.size() >= len && has_dicom_magic(&reader.read_exact_at(0, len as usize)?) {
        return Ok(SlideFormat::Dicom);
    }

    Err(FormatError::UnsupportedFormat {
        reason: format!("{} is not a recognized slide file", path.display()),
    })
}

/// Compute the container hint for a file by checking for a TIFF header.
pub fn sniff_container(path: &Path) -> Result<ContainerHint, FormatError> {
    let reader = LocalFileReader::open(path)?;
    if reader.size() < TIFF_HEADER_SIZE as u64 {
        return Ok(ContainerHint::Unknown);
    }

    let header = reader.read_exact_at(0, TIFF_HEADER_SIZE)?;
    Ok(if is_tiff_header(&header) {
        ContainerHint::TaggedContainer
    } else {
        ContainerHint::Unknown
    })
}

/// Check if bytes start with a DICOM preamble and magic.
pub fn has_dicom_magic(bytes: &[u8]) -> bool {
    bytes.len() >= DICOM_MAGIC_OFFSET + DICOM_MAGIC.len()
        && &bytes[DICOM_MAGIC_OFFSET..DICOM_MAGIC_OFFSET + DICOM_MAGIC.len()] == DICOM_MAGIC
}

/// Check if bytes represent a valid TIFF or BigTIFF header.
///
/// This is a quick check that can be used before attempting full parsing.
pub fn is_tiff_header(bytes: &[u8]) -> bool {
    if bytes.len() < TIFF_HEADER_SIZE {
        return false;
    }

    let version = match &bytes[0..2] {
        b"II" => u16::from_le_bytes([bytes[2], bytes[3]]),
        b"MM" => u16::from_be_bytes([bytes[2], bytes[3]]),
        _ => return false,
    };
    version == 42 || version == 43
}

// =============================================================================
// Tests
// =============================================================================
