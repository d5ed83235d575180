//! # WSI Pyramid
//!
//! Random-access reader for multi-file Whole Slide Images (WSI).
//!
//! This library opens slides that are stored as many files, exposes them as
//! a multi-resolution pyramid, and reads arbitrary regions as premultiplied
//! ARGB pixels. Only the tiles a region touches are located and decoded.
//!
//! ## Features
//!
//! - **Tiled JPEG**: baseline JPEG files with restart markers arranged by a
//!   `.vms` key file; each restart unit is served as an independent tile
//! - **Lazy indexing**: restart markers are found on demand and by a
//!   background thread, optionally seeded from a hint file
//! - **Scaled levels**: every JPEG level is also exposed at 1/2, 1/4 and 1/8
//! - **DICOM WSI**: a directory of VL Whole Slide Microscopy files assembled
//!   into one pyramid with label and overview images
//! - **Tile caching**: decoded tiles are kept in a byte-budgeted LRU cache
//!   shared by all readers of a slide
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`io`] - Positioned reads over local files and memory
//! - [`mod@format`] - JPEG marker parsing, restart-unit location, key and
//!   hint files, and the tiled JPEG and DICOM backends
//! - [`slide`] - Pyramid assembly, multi-file assembly and the [`Slide`]
//!   handle
//! - [`tile`] - Tile cache, decoder, grid reader and the async
//!   [`RegionService`]
//! - [`config`] - CLI types for the `wsi-pyramid` binary
//!
//! ## Example
//!
//! ```rust,no_run
//! use wsi_pyramid::{Slide, SlideOptions};
//!
//! let slide = Slide::open("slides/sample.vms", &SlideOptions::default())?;
//! println!("{} levels, level 0 is {:?}", slide.level_count(), slide.dimensions());
//!
//! let level = slide.best_level_for_downsample(4.0).unwrap_or(0);
//! let mut pixels = vec![0u32; 512 * 512];
//! slide.read_region(&mut pixels, 1000, 2000, level, 512, 512)?;
//! # Ok::<(), wsi_pyramid::SlideError>(())
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod io;
pub mod slide;
pub mod tile;

// Re-export commonly used types
pub use config::{CheckConfig, Cli, Command, IndexConfig};
pub use error::{DecodeError, FormatError, IoError, RegionError, SlideError};
pub use format::{
    detect_format, sniff_container, ContainerHint, DicomSlide, SlideFormat, TileByteRange,
    TiledJpegSlide,
};
pub use io::{LocalFileReader, MemoryReader, RangeReader};
pub use slide::{LevelInfo, Slide, SlideOptions, SlideReader};
pub use tile::{
    CacheStats, ImageJpegDecoder, RegionRequest, RegionResponse, RegionService, TileBuffer,
    TileCache, TileDecoder, TileKey, DEFAULT_TILE_CACHE_CAPACITY,
};
