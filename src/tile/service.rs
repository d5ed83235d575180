//! Region service for async callers.
//!
//! Slide reads block on file I/O and JPEG decoding. The RegionService wraps a
//! shared [`Slide`] and runs every read on tokio's blocking pool, so it can be
//! called from async code without stalling the runtime.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        RegionService                             │
//! │  1. Validate request      2. spawn_blocking(read_region)        │
//! │           │                          │                          │
//! │           ▼                          ▼                          │
//! │    ┌──────────────┐        ┌──────────────────────┐             │
//! │    │ level bounds │        │ Arc<Slide> + cache   │             │
//! │    └──────────────┘        └──────────────────────┘             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::task;
use tracing::debug;

use crate::error::{RegionError, SlideError};
use crate::slide::Slide;

use super::cache::TileBuffer;

/// Default upper bound on the pixels of one region (64 Mi pixels, 256 MiB).
pub const DEFAULT_MAX_REGION_PIXELS: u64 = 64 * 1024 * 1024;

// =============================================================================
// Region Request
// =============================================================================

/// A request for a region of one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRequest {
    /// Left edge in level-0 pixels
    pub x: i64,

    /// Top edge in level-0 pixels
    pub y: i64,

    /// Pyramid level (0 = highest resolution)
    pub level: usize,

    /// Output width in pixels of `level`
    pub width: u32,

    /// Output height in pixels of `level`
    pub height: u32,
}

impl RegionRequest {
    pub fn new(x: i64, y: i64, level: usize, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            level,
            width,
            height,
        }
    }

    /// Number of output pixels.
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

// =============================================================================
// Region Response
// =============================================================================

/// Pixels of a region, premultiplied ARGB, row-major.
#[derive(Debug, Clone)]
pub struct RegionResponse {
    pub pixels: Vec<u32>,
    pub width: u32,
    pub height: u32,
    pub level: usize,
}

impl From<(TileBuffer, usize)> for RegionResponse {
    fn from((buffer, level): (TileBuffer, usize)) -> Self {
        Self {
            pixels: buffer.pixels,
            width: buffer.width,
            height: buffer.height,
            level,
        }
    }
}

// =============================================================================
// Region Service
// =============================================================================

/// Async front end over a shared slide.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use wsi_pyramid::{RegionRequest, RegionService, Slide, SlideOptions};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let slide = Arc::new(Slide::open("slide.vms", &SlideOptions::default())?);
/// let service = RegionService::new(slide);
///
/// let region = service.get_region(RegionRequest::new(0, 0, 0, 512, 512)).await?;
/// println!("{}x{} pixels", region.width, region.height);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RegionService {
    slide: Arc<Slide>,
    max_region_pixels: u64,
}

impl RegionService {
    /// Create a service with the default region size limit.
    pub fn new(slide: Arc<Slide>) -> Self {
        Self {
            slide,
            max_region_pixels: DEFAULT_MAX_REGION_PIXELS,
        }
    }

    /// Create a service with a custom region size limit.
    pub fn with_max_region_pixels(slide: Arc<Slide>, max_region_pixels: u64) -> Self {
        Self {
            slide,
            max_region_pixels,
        }
    }

    /// The slide behind this service.
    pub fn slide(&self) -> &Arc<Slide> {
        &self.slide
    }

    /// Check a request against the slide's levels and the size limit.
    pub fn validate(&self, request: &RegionRequest) -> Result<(), RegionError> {
        self.check_size(request.level, request.width, request.height)
    }

    fn check_size(&self, level: usize, width: u32, height: u32) -> Result<(), RegionError> {
        let level_count = self.slide.level_count();
        if level >= level_count {
            return Err(RegionError::InvalidLevel { level, level_count });
        }
        if width == 0 || height == 0 {
            return Err(RegionError::InvalidRequest(format!(
                "empty region {}x{}",
                width, height
            )));
        }
        let pixels = width as u64 * height as u64;
        if pixels > self.max_region_pixels {
            return Err(RegionError::InvalidRequest(format!(
                "region of {} pixels exceeds the limit of {}",
                pixels, self.max_region_pixels
            )));
        }
        Ok(())
    }

    /// Read a region on the blocking pool.
    pub async fn get_region(&self, request: RegionRequest) -> Result<RegionResponse, RegionError> {
        self.validate(&request)?;
        let RegionRequest {
            x,
            y,
            level,
            width,
            height,
        } = request;
        self.read_blocking(level, width, height, move |slide, dest| {
            slide.read_region(dest, x, y, level, width, height)
        })
        .await
    }

    /// Read one tile of a level's grid, clipped to the level bounds.
    ///
    /// The tile is addressed in the level's own pixel space, so no level-0
    /// coordinate is involved.
    pub async fn get_tile(
        &self,
        level: usize,
        col: u32,
        row: u32,
    ) -> Result<RegionResponse, RegionError> {
        let info = self.slide.level_info(level).ok_or(RegionError::InvalidLevel {
            level,
            level_count: self.slide.level_count(),
        })?;
        if col >= info.tiles_x || row >= info.tiles_y {
            return Err(RegionError::InvalidRequest(format!(
                "tile ({}, {}) outside the {}x{} grid of level {}",
                col, row, info.tiles_x, info.tiles_y, level
            )));
        }

        let left = col * info.tile_width;
        let top = row * info.tile_height;
        let width = info.tile_width.min(info.width - left);
        let height = info.tile_height.min(info.height - top);
        self.check_size(level, width, height)?;

        self.read_blocking(level, width, height, move |slide, dest| {
            slide.read_level_region(dest, level, left as i64, top as i64, width, height)
        })
        .await
    }

    async fn read_blocking<F>(
        &self,
        level: usize,
        width: u32,
        height: u32,
        read: F,
    ) -> Result<RegionResponse, RegionError>
    where
        F: FnOnce(&Slide, &mut [u32]) -> Result<(), SlideError> + Send + 'static,
    {
        let slide = Arc::clone(&self.slide);
        let pixels = task::spawn_blocking(move || {
            let mut pixels = vec![0u32; width as usize * height as usize];
            read(slide.as_ref(), pixels.as_mut_slice()).map(|()| pixels)
        })
        .await
        .map_err(|e| RegionError::TaskFailed(e.to_string()))??;

        Ok(RegionResponse {
            pixels,
            width,
            height,
            level,
        })
    }

    /// Read a whole level small enough to fit in `max_dimension`.
    ///
    /// Picks the best level for the implied downsample; the result may be
    /// somewhat smaller than `max_dimension`, never larger unless even the
    /// smallest level is.
    pub async fn thumbnail(&self, max_dimension: u32) -> Result<RegionResponse, RegionError> {
        if max_dimension == 0 {
            return Err(RegionError::InvalidRequest("zero thumbnail size".to_string()));
        }

        let (width, height) = self.slide.dimensions().ok_or(RegionError::InvalidLevel {
            level: 0,
            level_count: 0,
        })?;
        let downsample = width.max(height) as f64 / max_dimension as f64;
        let level = self
            .slide
            .best_level_for_downsample(downsample)
            .unwrap_or(self.slide.level_count().saturating_sub(1));
        let (level_width, level_height) =
            self.slide
                .level_dimensions(level)
                .ok_or(RegionError::InvalidLevel {
                    level,
                    level_count: self.slide.level_count(),
                })?;

        debug!(level, level_width, level_height, "Reading thumbnail level");
        self.get_region(RegionRequest::new(0, 0, level, level_width, level_height))
            .await
    }

    /// Decode an associated image on the blocking pool.
    pub async fn associated_image(&self, name: &str) -> Result<RegionResponse, RegionError> {
        let slide = Arc::clone(&self.slide);
        let name = name.to_string();
        let buffer = task::spawn_blocking(move || slide.read_associated_image(&name))
            .await
            .map_err(|e| RegionError::TaskFailed(e.to_string()))??;
        Ok(RegionResponse::from((buffer, 0)))
    }
}

// =============================================================================
// Tests
// =============================================================================
