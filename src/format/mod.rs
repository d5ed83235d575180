//! Format parsers and slide backends.
//!
//! Two slide formats are supported:
//!
//! - **Tiled JPEG**: baseline JPEG files with restart markers placed on a
//!   grid by a `.vms` key file ([`tiled_jpeg`])
//! - **DICOM WSI**: a directory of VL Whole Slide Microscopy files
//!   ([`dicom`])
//!
//! Use [`detect::detect_format`] to pick the backend for a file. The JPEG
//! marker parsing and restart-unit location live in [`jpeg`] and
//! [`locator`]; [`vms`] and [`hints`] read the side files of a tiled JPEG
//! slide.

pub mod detect;
pub mod dicom;
pub mod hints;
pub mod jpeg;
pub mod locator;
pub mod tiled_jpeg;
pub mod vms;

pub use detect::{
    detect_format, has_dicom_magic, is_tiff_header, sniff_container, ContainerHint, SlideFormat,
};
pub use dicom::{DicomOpener, DicomSlide, VL_WSI_SOP_CLASS};
pub use hints::{load_hints, save_hints};
pub use jpeg::{build_tile_stream, JpegHeader, RestartGeometry};
pub use locator::OffsetTable;
pub use tiled_jpeg::{TileByteRange, TiledJpegSlide};
pub use vms::{JpegFragment, KeyFile};
