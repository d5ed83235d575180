//! SlideReader trait for format-agnostic slide access.
//!
//! Every backend exposes its levels as tile grids ([`TileSource`]) plus a
//! little metadata. The trait builds the level queries and region reads on
//! top of that, so the [`crate::slide::Slide`] facade can treat the tiled
//! JPEG and DICOM backends alike.

use std::collections::BTreeMap;

use crate::error::SlideError;
use crate::tile::{grid, TileBuffer, TileSource};

// =============================================================================
// Level Information
// =============================================================================

/// Information about a single pyramid level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelInfo {
    /// Width of this level in pixels
    pub width: u32,

    /// Height of this level in pixels
    pub height: u32,

    /// Width of each tile in pixels
    pub tile_width: u32,

    /// Height of each tile in pixels
    pub tile_height: u32,

    /// Number of tiles in X direction
    pub tiles_x: u32,

    /// Number of tiles in Y direction
    pub tiles_y: u32,

    /// Downsample factor relative to level 0
    ///
    /// Level 0 has downsample 1.0, level 1 might have 2.0, etc.
    pub downsample: f64,
}

// =============================================================================
// SlideReader Trait
// =============================================================================

/// Format-agnostic interface for reading regions from Whole Slide Images.
pub trait SlideReader: TileSource {
    /// Get the downsample factor for a level.
    ///
    /// Returns `None` if level is out of range.
    fn level_downsample(&self, level: usize) -> Option<f64>;

    /// Convert level-0 coordinates into a level's pixel space.
    fn to_level_coords(&self, level: usize, x: i64, y: i64) -> Option<(i64, i64)>;

    /// Backend-specific properties.
    fn properties(&self) -> &BTreeMap<String, String>;

    /// Free-text comment embedded in the slide, if any.
    fn comment(&self) -> Option<&str> {
        None
    }

    /// Names of the associated images (label, overview, ...).
    fn associated_image_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Decode an associated image.
    fn read_associated_image(&self, name: &str) -> Result<TileBuffer, SlideError> {
        Err(SlideError::AssociatedImageNotFound(name.to_string()))
    }

    /// Get dimensions of the full-resolution (level 0) image.
    fn dimensions(&self) -> Option<(u32, u32)> {
        self.level_dimensions(0)
    }

    /// Get dimensions of a specific level.
    fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.grid(level).map(|g| (g.width, g.height))
    }

    /// Get tile size for a level.
    ///
    /// Note: Edge tiles may extend past the level; those pixels read as 0.
    fn tile_size(&self, level: usize) -> Option<(u32, u32)> {
        self.grid(level).map(|g| (g.tile_width, g.tile_height))
    }

    /// Get the number of tiles in X and Y directions for a level.
    fn tile_count(&self, level: usize) -> Option<(u32, u32)> {
        self.grid(level).map(|g| (g.tiles_across, g.tiles_down))
    }

    /// Get complete information about a level.
    fn level_info(&self, level: usize) -> Option<LevelInfo> {
        let grid = self.grid(level)?;
        Some(LevelInfo {
            width: grid.width,
            height: grid.height,
            tile_width: grid.tile_width,
            tile_height: grid.tile_height,
            tiles_x: grid.tiles_across,
            tiles_y: grid.tiles_down,
            downsample: self.level_downsample(level)?,
        })
    }

    /// Find the best level for a given downsample factor.
    ///
    /// Returns the level with the smallest downsample that is greater than or
    /// equal to the requested factor, falling back to the lowest resolution.
    fn best_level_for_downsample(&self, downsample: f64) -> Option<usize> {
        let levels: Vec<(usize, f64)> = (0..self.level_count())
            .filter_map(|l| self.level_downsample(l).map(|d| (l, d)))
            .collect();

        levels
            .iter()
            .filter(|(_, d)| *d >= downsample * 0.99)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .or_else(|| levels.iter().max_by(|a, b| a.1.total_cmp(&b.1)))
            .map(|(l, _)| *l)
    }

    /// Read a region into `dest`.
    ///
    /// `x` and `y` are level-0 coordinates of the top-left pixel; `width` x
    /// `height` is the number of output pixels at `level`.
    fn read_region(
        &self,
        dest: &mut [u32],
        x: i64,
        y: i64,
        level: usize,
        width: u32,
        height: u32,
    ) -> Result<(), SlideError> {
        let (lx, ly) = self
            .to_level_coords(level, x, y)
            .ok_or(SlideError::InvalidLevel {
                level,
                level_count: self.level_count(),
            })?;
        self.read_level_region(dest, level, lx, ly, width, height)
    }

    /// Read a region whose top-left pixel is given in `level`'s own pixel
    /// space.
    fn read_level_region(
        &self,
        dest: &mut [u32],
        level: usize,
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    ) -> Result<(), SlideError> {
        grid::read_region(self, dest, level, x, y, width, height)
    }
}

// =============================================================================
// Tests
// =============================================================================
