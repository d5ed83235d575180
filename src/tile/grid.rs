//! Grid reader: composes pixel regions from cached tiles.
//!
//! Backends expose their levels as regular tile grids through [`TileSource`].
//! The reader maps a region to the tiles it overlaps, pulls each tile from
//! the slide's cache or decodes it, and copies the visible part into the
//! output.
//!
//! # Decode Deduplication
//!
//! On a cache miss the reader takes the decode lock of the tile's source
//! image, checks the cache again, and only then decodes. Concurrent readers
//! of one tile therefore decode it once: the second waits on the lock and
//! finds the tile in the cache. The cache's own lock is never held while
//! decoding.
//!
//! # Edge Tiles
//!
//! Tiles on the right and bottom edge of a level can extend past it. After
//! decoding, such tiles are normalized to the full tile size with every pixel
//! outside the level set to 0 (transparent).

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::SlideError;
use crate::tile::cache::{TileBuffer, TileCache, TileKey};

/// Geometry of one level's tile grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridGeometry {
    /// Level width in pixels
    pub width: u32,

    /// Level height in pixels
    pub height: u32,

    /// Tile width in pixels
    pub tile_width: u32,

    /// Tile height in pixels
    pub tile_height: u32,

    /// Tiles per row
    pub tiles_across: u32,

    /// Tiles per column
    pub tiles_down: u32,
}

impl GridGeometry {
    /// Build a grid that covers `width` x `height` with tiles of the given size.
    pub fn covering(width: u32, height: u32, tile_width: u32, tile_height: u32) -> Self {
        Self {
            width,
            height,
            tile_width,
            tile_height,
            tiles_across: width.div_ceil(tile_width.max(1)),
            tiles_down: height.div_ceil(tile_height.max(1)),
        }
    }
}

/// A slide backend viewed as a set of tile grids.
pub trait TileSource: Send + Sync {
    /// Number of levels.
    fn level_count(&self) -> usize;

    /// Grid geometry of a level, or `None` if the level doesn't exist.
    fn grid(&self, level: usize) -> Option<GridGeometry>;

    /// The slide's tile cache.
    fn cache(&self) -> &TileCache;

    /// Lock serializing decodes from the source image backing a tile.
    fn decode_lock(&self, level: usize, col: u32, row: u32) -> Result<&Mutex<()>, SlideError>;

    /// Decode a tile. The result may be smaller or larger than the grid's
    /// tile size; the reader normalizes it.
    fn decode_tile(&self, level: usize, col: u32, row: u32) -> Result<TileBuffer, SlideError>;
}

fn level_grid<S: TileSource + ?Sized>(source: &S, level: usize) -> Result<GridGeometry, SlideError> {
    source.grid(level).ok_or(SlideError::InvalidLevel {
        level,
        level_count: source.level_count(),
    })
}

/// Read one tile through the cache.
///
/// The returned tile always has the grid's tile size.
pub fn read_tile<S: TileSource + ?Sized>(
    source: &S,
    level: usize,
    col: u32,
    row: u32,
) -> Result<Arc<TileBuffer>, SlideError> {
    let grid = level_grid(source, level)?;
    let key = TileKey::new(level, col, row);

    if let Some(tile) = source.cache().get(&key) {
        return Ok(tile);
    }

    let lock = source.decode_lock(level, col, row)?;
    let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(tile) = source.cache().get(&key) {
        return Ok(tile);
    }

    let decoded = source.decode_tile(level, col, row)?;
    let visible_width = grid
        .width
        .saturating_sub(col * grid.tile_width)
        .min(grid.tile_width);
    let visible_height = grid
        .height
        .saturating_sub(row * grid.tile_height)
        .min(grid.tile_height);

    let tile = clip_tile(
        decoded,
        grid.tile_width,
        grid.tile_height,
        visible_width,
        visible_height,
    );
    Ok(source.cache().put(key, tile))
}

/// Normalize a decoded tile to `tile_width` x `tile_height`, keeping only the
/// top-left `visible_width` x `visible_height` pixels.
pub fn clip_tile(
    decoded: TileBuffer,
    tile_width: u32,
    tile_height: u32,
    visible_width: u32,
    visible_height: u32,
) -> TileBuffer {
    let keep_width = visible_width.min(decoded.width).min(tile_width) as usize;
    let keep_height = visible_height.min(decoded.height).min(tile_height) as usize;

    if decoded.width == tile_width
        && decoded.height == tile_height
        && keep_width == tile_width as usize
        && keep_height == tile_height as usize
    {
        return decoded;
    }

    let mut pixels = vec![0u32; tile_width as usize * tile_height as usize];
    for y in 0..keep_height {
        let src = y * decoded.width as usize;
        let dst = y * tile_width as usize;
        pixels[dst..dst + keep_width].copy_from_slice(&decoded.pixels[src..src + keep_width]);
    }

    TileBuffer::new(pixels, tile_width, tile_height)
}

/// Inclusive range of tile indices overlapping `[start, start + len)`,
/// clipped to `[0, count)`.
fn tile_span(start: i64, len: u32, tile_size: u32, count: u32) -> Option<(u32, u32)> {
    if len == 0 || count == 0 || tile_size == 0 {
        return None;
    }
    let tile_size = tile_size as i64;
    let first = start.div_euclid(tile_size).max(0);
    let last = (start + len as i64 - 1).div_euclid(tile_size).min(count as i64 - 1);

    (first <= last).then_some((first as u32, last as u32))
}

/// Read a region of a level into `dest`.
///
/// `x` and `y` are in the level's own pixel space; `width` x `height` pixels
/// are written row-major into the start of `dest`. Pixels outside the level
/// are 0. If any tile fails, `dest` is left untouched.
pub fn read_region<S: TileSource + ?Sized>(
    source: &S,
    dest: &mut [u32],
    level: usize,
    x: i64,
    y: i64,
    width: u32,
    height: u32,
) -> Result<(), SlideError> {
    let required = width as usize * height as usize;
    if dest.len() < required {
        return Err(SlideError::BufferTooSmall {
            required,
            actual: dest.len(),
        });
    }

    let grid = level_grid(source, level)?;
    let mut scratch = vec![0u32; required];

    let cols = tile_span(x, width, grid.tile_width, grid.tiles_across);
    let rows = tile_span(y, height, grid.tile_height, grid.tiles_down);

    if let (Some((first_col, last_col)), Some((first_row, last_row))) = (cols, rows) {
        for row in first_row..=last_row {
            for col in first_col..=last_col {
                let tile = read_tile(source, level, col, row)?;
                blit(&tile, col, row, &grid, &mut scratch, x, y, width, height);
            }
        }
    }

    dest[..required].copy_from_slice(&scratch);
    Ok(())
}

/// Copy the part of a tile that falls inside the region.
#[allow(clippy::too_many_arguments)]
fn blit(
    tile: &TileBuffer,
    col: u32,
    row: u32,
    grid: &GridGeometry,
    out: &mut [u32],
    x: i64,
    y: i64,
    width: u32,
    height: u32,
) {
    let tile_x = col as i64 * grid.tile_width as i64;
    let tile_y = row as i64 * grid.tile_height as i64;

    let x0 = tile_x.max(x);
    let x1 = (tile_x + tile.width as i64).min(x + width as i64);
    let y0 = tile_y.max(y);
    let y1 = (tile_y + tile.height as i64).min(y + height as i64);
    if x0 >= x1 || y0 >= y1 {
        return;
    }

    let span = (x1 - x0) as usize;
    for py in y0..y1 {
        let src = (py - tile_y) as usize * tile.width as usize + (x0 - tile_x) as usize;
        let dst = (py - y) as usize * width as usize + (x0 - x) as usize;
        out[dst..dst + span].copy_from_slice(&tile.pixels[src..src + span]);
    }
}
