//! Pyramid assembly for tiled JPEG slides.
//!
//! A tiled JPEG slide arrives as a list of JPEG files, each placed at a
//! (level, column, row) grid coordinate. Files must be supplied in canonical
//! order: level by level, row by row, left to right, with no gaps.
//!
//! Each group of files sharing a level becomes one base level. A baseline
//! JPEG decoder can reduce by 1/2, 1/4 and 1/8 while decoding, so every base
//! level also yields three virtual levels that reuse the same files with a
//! larger scale denominator.

use std::sync::Arc;

use tracing::debug;

use crate::error::FormatError;
use crate::tile::SCALE_DENOMINATORS;

// =============================================================================
// Grid Coordinates
// =============================================================================

/// Position of a source file in the pyramid grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridCoordinate {
    pub level: i64,
    pub col: i64,
    pub row: i64,
}

impl GridCoordinate {
    pub fn new(level: i64, col: i64, row: i64) -> Self {
        Self { level, col, row }
    }

    /// Whether `self` may directly follow `prev` in canonical order.
    ///
    /// The first coordinate (no predecessor) must be (0, 0, 0). After that
    /// the only allowed steps are one column right, the start of the next
    /// row, or the origin of the next level.
    pub fn is_successor_of(&self, prev: Option<&GridCoordinate>) -> bool {
        let Some(prev) = prev else {
            return (self.level, self.col, self.row) == (0, 0, 0);
        };

        if self.level == prev.level + 1 {
            return self.col == 0 && self.row == 0;
        }
        if self.level != prev.level {
            return false;
        }
        if self.row == prev.row + 1 {
            return self.col == 0;
        }
        self.row == prev.row && self.col == prev.col + 1
    }
}

/// A source file with its grid position and pixel size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlacement {
    pub coord: GridCoordinate,

    /// Index of the source in the slide's source list
    pub source: usize,

    pub width: u32,
    pub height: u32,
}

// =============================================================================
// Pyramid Levels
// =============================================================================

/// One level of a tiled JPEG pyramid.
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidLevel {
    /// Source indices, row-major, `sources_across * sources_down` entries
    pub sources: Arc<[usize]>,

    /// Unscaled size of the whole level
    pub pixel_width: u32,
    pub pixel_height: u32,

    pub sources_across: u32,
    pub sources_down: u32,

    /// Unscaled size of source (0, 0), used to find the file under a pixel
    pub image00_width: u32,
    pub image00_height: u32,

    /// Decoder scale denominator (1, 2, 4 or 8)
    pub scale_denom: u32,

    /// Level 0 width over this level's unscaled width
    pub no_scale_denom_downsample: f64,
}

impl PyramidLevel {
    /// Width as exposed to readers.
    pub fn width(&self) -> u32 {
        self.pixel_width / self.scale_denom
    }

    /// Height as exposed to readers.
    pub fn height(&self) -> u32 {
        self.pixel_height / self.scale_denom
    }

    /// Downsample relative to level 0.
    pub fn downsample(&self) -> f64 {
        self.no_scale_denom_downsample * self.scale_denom as f64
    }

    /// Convert a level-0 coordinate into this level's pixel space.
    pub fn to_level_coord(&self, v: i64) -> i64 {
        (v as f64 / self.no_scale_denom_downsample / self.scale_denom as f64) as i64
    }
}

struct LevelAccumulator {
    level: i64,
    sources: Vec<usize>,
    width: u64,
    height: u64,
    image00: (u32, u32),

    /// Sources per row, fixed when row 0 ends
    columns: Option<i64>,
}

impl LevelAccumulator {
    /// Record a row ending at `last_col`; every row must match row 0.
    fn close_row(&mut self, last_col: i64) -> Result<(), FormatError> {
        match self.columns {
            None => {
                self.columns = Some(last_col + 1);
                Ok(())
            }
            Some(columns) if columns == last_col + 1 => Ok(()),
            Some(columns) => Err(FormatError::Geometry(format!(
                "level {} has a row of {} sources, row 0 has {}",
                self.level,
                last_col + 1,
                columns
            ))),
        }
    }
}

/// Group ordered placements into levels and synthesize scaled levels.
///
/// Levels come back sorted from largest to smallest exposed width. Levels
/// that tie on width keep their generation order.
pub fn assemble_pyramid(placements: &[TilePlacement]) -> Result<Vec<PyramidLevel>, FormatError> {
    let mut levels = Vec::new();
    let mut level0_width = 0u32;
    let mut prev: Option<GridCoordinate> = None;
    let mut current: Option<LevelAccumulator> = None;

    for (i, placement) in placements.iter().enumerate() {
        let coord = placement.coord;
        if !coord.is_successor_of(prev.as_ref()) {
            let prev = prev.unwrap_or(GridCoordinate::new(-1, -1, -1));
            return Err(FormatError::CoordinateOrder {
                prev_level: prev.level,
                prev_col: prev.col,
                prev_row: prev.row,
                level: coord.level,
                col: coord.col,
                row: coord.row,
            });
        }

        let acc = current.get_or_insert_with(|| LevelAccumulator {
            level: coord.level,
            sources: Vec::new(),
            width: 0,
            height: 0,
            image00: (0, 0),
            columns: None,
        });

        if coord.col == 0 && coord.row > 0 {
            if let Some(prev) = prev.filter(|p| p.level == coord.level) {
                acc.close_row(prev.col)?;
            }
        }

        if coord.col == 0 && coord.row == 0 {
            acc.image00 = (placement.width, placement.height);
        }
        if coord.row == 0 {
            acc.width += placement.width as u64;
        }
        if coord.col == 0 {
            acc.height += placement.height as u64;
        }
        acc.sources.push(placement.source);

        let last_of_level = placements
            .get(i + 1)
            .map_or(true, |next| next.coord.level != coord.level);

        if last_of_level {
            if let Some(mut acc) = current.take() {
                acc.close_row(coord.col)?;
                let (across, down) = (coord.col + 1, coord.row + 1);

                let pixel_width = to_u32(acc.width, "level width")?;
                let pixel_height = to_u32(acc.height, "level height")?;
                if acc.level == 0 {
                    level0_width = pixel_width;
                }

                debug!(
                    level = acc.level,
                    pixel_width,
                    pixel_height,
                    sources_across = across,
                    sources_down = down,
                    "Assembled base level"
                );

                push_scaled_levels(
                    &mut levels,
                    acc,
                    across as u32,
                    down as u32,
                    pixel_width,
                    pixel_height,
                    level0_width,
                );
            }
        }

        prev = Some(coord);
    }

    if levels.is_empty() {
        return Err(FormatError::NoTiles);
    }

    // Stable: ties keep generation order
    levels.sort_by_key(|l: &PyramidLevel| std::cmp::Reverse(l.width()));
    Ok(levels)
}

fn push_scaled_levels(
    levels: &mut Vec<PyramidLevel>,
    acc: LevelAccumulator,
    sources_across: u32,
    sources_down: u32,
    pixel_width: u32,
    pixel_height: u32,
    level0_width: u32,
) {
    let sources: Arc<[usize]> = acc.sources.into();

    for scale_denom in SCALE_DENOMINATORS {
        levels.push(PyramidLevel {
            sources: Arc::clone(&sources),
            pixel_width,
            pixel_height,
            sources_across,
            sources_down,
            image00_width: acc.image00.0,
            image00_height: acc.image00.1,
            scale_denom,
            no_scale_denom_downsample: level0_width as f64 / pixel_width as f64,
        });
    }
}

fn to_u32(value: u64, what: &str) -> Result<u32, FormatError> {
    u32::try_from(value)
        .map_err(|_| FormatError::Geometry(format!("{} {} exceeds u32", what, value)))
}
