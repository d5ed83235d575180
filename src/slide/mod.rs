//! Slide abstraction layer.
//!
//! This module provides a unified interface for working with Whole Slide Images
//! regardless of their underlying format.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                 Slide                   │
//! │  (detects format, common properties)    │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │           SlideReader Trait             │
//! │  (level queries, region reads)          │
//! └────────────────────┬────────────────────┘
//!                      │
//!          ┌───────────┴───────────┐
//!          ▼                       ▼
//! ┌─────────────────┐    ┌─────────────────────┐
//! │ TiledJpegSlide  │    │     DicomSlide      │
//! │ (pyramid of     │    │ (multi-file         │
//! │  JPEG files)    │    │  assembler)         │
//! └─────────────────┘    └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use wsi_pyramid::{Slide, SlideOptions};
//!
//! let slide = Slide::open("slide.vms", &SlideOptions::default())?;
//! let (width, height) = slide.dimensions().unwrap_or((0, 0));
//!
//! let mut pixels = vec![0u32; 256 * 256];
//! slide.read_region(&mut pixels, (width / 2) as i64, (height / 2) as i64, 0, 256, 256)?;
//! # Ok::<(), wsi_pyramid::SlideError>(())
//! ```

pub mod multifile;
mod options;
pub mod pyramid;
mod reader;
mod whole_slide;

pub use multifile::{assemble_members, AssembledSlide, MemberOpener, TagReader};
pub use options::SlideOptions;
pub use pyramid::{assemble_pyramid, GridCoordinate, PyramidLevel, TilePlacement};
pub use reader::{LevelInfo, SlideReader};
pub use whole_slide::Slide;
