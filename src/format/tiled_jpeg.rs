//! Tiled JPEG slide backend.
//!
//! A tiled JPEG slide is a set of baseline JPEG files with restart markers,
//! each placed on a (level, column, row) grid, usually by a `.vms` key file.
//! Every restart unit of a file decodes independently, so a unit is one
//! tile of the pyramid.
//!
//! # Lazy Indexing
//!
//! Unit offsets are unknown when the slide opens. A foreground read scans
//! just far enough to find the units it needs, while a background thread
//! walks every file in order and fills in the rest. Both go through one
//! per-slide lock around the offset tables; decoding happens outside it.
//!
//! # Scaled Levels
//!
//! Every grid level is exposed four times, at decoder scale 1/1, 1/2, 1/4
//! and 1/8, sharing the same files and offset tables.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{FormatError, SlideError};
use crate::format::hints::load_hints;
use crate::format::jpeg::{build_tile_stream, JpegHeader, RestartGeometry};
use crate::format::locator::{self, OffsetTable};
use crate::format::vms::{JpegFragment, KeyFile};
use crate::io::{LocalFileReader, RangeReader};
use crate::slide::pyramid::{assemble_pyramid, GridCoordinate, PyramidLevel, TilePlacement};
use crate::slide::{SlideOptions, SlideReader};
use crate::tile::{GridGeometry, TileBuffer, TileCache, TileDecoder, TileSource};

// =============================================================================
// Sources
// =============================================================================

/// One JPEG file of the slide.
struct JpegSource {
    reader: Arc<dyn RangeReader>,
    header: JpegHeader,
    header_bytes: Bytes,
    geometry: RestartGeometry,
    decode_lock: Mutex<()>,
}

/// Offset tables of every source plus the indexer's stop flag.
struct IndexState {
    tables: Vec<OffsetTable>,
    should_terminate: bool,
}

/// State shared with the background indexer.
struct Shared {
    sources: Vec<JpegSource>,
    index: Mutex<IndexState>,
}

impl Shared {
    fn lock_index(&self) -> MutexGuard<'_, IndexState> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Byte range of one tile within its source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileByteRange {
    /// Index of the source file
    pub source: usize,

    /// Restart unit within the source
    pub unit: usize,

    /// First byte of the unit's scan data
    pub start: u64,

    /// One past the unit's closing marker
    pub stop: u64,

    /// Decoder scale denominator of the level
    pub scale_denom: u32,
}

/// Where a tile lives before its offsets are known.
struct TileLocation {
    source: usize,
    unit: usize,
    scale_denom: u32,
}

// =============================================================================
// Tiled JPEG Slide
// =============================================================================

/// A slide assembled from tiled JPEG files.
pub struct TiledJpegSlide {
    shared: Arc<Shared>,
    levels: Vec<PyramidLevel>,
    cache: TileCache,
    decoder: Arc<dyn TileDecoder>,
    indexer: Mutex<Option<JoinHandle<()>>>,
    properties: BTreeMap<String, String>,
}

impl TiledJpegSlide {
    /// Open a slide from a `.vms` key file.
    pub fn open(path: &Path, options: &SlideOptions) -> Result<Self, SlideError> {
        let key_file = KeyFile::read(path)?;

        let hints = match &key_file.hint_file {
            Some(hint_path) => match load_hints(hint_path) {
                Ok(hints) => Some(hints),
                Err(e) => {
                    warn!(path = %hint_path.display(), error = %e, "Ignoring unreadable hint file");
                    None
                }
            },
            None => None,
        };

        let mut slide = Self::from_fragments(&key_file.fragments, hints, options)?;
        for (key, value) in &key_file.properties {
            slide
                .properties
                .insert(format!("hamamatsu.{}", key), value.clone());
        }
        Ok(slide)
    }

    /// Open a slide from JPEG files already sorted by (level, row, column).
    pub fn from_fragments(
        fragments: &[JpegFragment],
        hints: Option<Vec<Vec<u64>>>,
        options: &SlideOptions,
    ) -> Result<Self, SlideError> {
        let sources = fragments
            .iter()
            .map(|f| {
                let reader: Arc<dyn RangeReader> = Arc::new(LocalFileReader::open(&f.path)?);
                Ok((GridCoordinate::new(f.level, f.col, f.row), reader))
            })
            .collect::<Result<Vec<_>, SlideError>>()?;

        Self::from_readers(sources, hints, options)
    }

    /// Open a slide from readers placed on the grid, in canonical order.
    pub fn from_readers(
        readers: Vec<(GridCoordinate, Arc<dyn RangeReader>)>,
        hints: Option<Vec<Vec<u64>>>,
        options: &SlideOptions,
    ) -> Result<Self, SlideError> {
        let hints = hints.filter(|h| {
            let usable = h.len() == readers.len();
            if !usable {
                warn!(
                    expected = readers.len(),
                    actual = h.len(),
                    "Ignoring hints for a different number of files"
                );
            }
            usable
        });
        let mut hints = hints.map(|h| h.into_iter());

        let mut sources = Vec::with_capacity(readers.len());
        let mut tables = Vec::with_capacity(readers.len());
        let mut placements = Vec::with_capacity(readers.len());

        for (index, (coord, reader)) in readers.into_iter().enumerate() {
            let (header, header_bytes) = JpegHeader::read(reader.as_ref())?;
            let geometry = header.restart_geometry()?;

            debug!(
                source = reader.identifier(),
                width = header.width,
                height = header.height,
                restart_interval = header.restart_interval,
                units = geometry.unit_count,
                tile_width = geometry.tile_width,
                tile_height = geometry.tile_height,
                "Opened JPEG source"
            );

            let mut table = OffsetTable::new(geometry.unit_count as usize, header.scan_start);
            if let Some(source_hints) = hints.as_mut().and_then(|h| h.next()) {
                table = table.with_hints(source_hints, reader.identifier());
            }

            placements.push(TilePlacement {
                coord,
                source: index,
                width: header.width,
                height: header.height,
            });
            tables.push(table);
            sources.push(JpegSource {
                reader,
                header,
                header_bytes,
                geometry,
                decode_lock: Mutex::new(()),
            });
        }

        let levels = assemble_pyramid(&placements)?;
        for level in &levels {
            check_level_geometry(level, &sources)?;
        }

        let mut properties = BTreeMap::new();
        if let Some(comment) = sources.first().and_then(|s| s.header.comment.clone()) {
            properties.insert("wsi.comment".to_string(), comment);
        }
        properties.insert(
            "wsi.quickhash-1".to_string(),
            quickhash(&placements, &sources),
        );

        let shared = Arc::new(Shared {
            sources,
            index: Mutex::new(IndexState {
                tables,
                should_terminate: false,
            }),
        });

        let indexer = if options.background_indexing {
            spawn_indexer(Arc::clone(&shared))
        } else {
            None
        };

        info!(
            sources = shared.sources.len(),
            levels = levels.len(),
            width = levels.first().map(|l| l.width()).unwrap_or(0),
            height = levels.first().map(|l| l.height()).unwrap_or(0),
            "Opened tiled JPEG slide"
        );

        Ok(Self {
            shared,
            levels,
            cache: TileCache::with_capacity(options.cache_capacity),
            decoder: Arc::clone(&options.decoder),
            indexer: Mutex::new(indexer),
            properties,
        })
    }

    /// Pyramid levels, largest first.
    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    /// Number of JPEG files.
    pub fn source_count(&self) -> usize {
        self.shared.sources.len()
    }

    /// Block until the background indexer has finished, then index anything
    /// it skipped (or everything, if background indexing is disabled).
    pub fn wait_for_index(&self) {
        let handle = self
            .indexer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Background indexer panicked");
            }
        }
        index_all(&self.shared);
    }

    /// Whether the offset of every restart unit is known.
    pub fn is_index_complete(&self) -> bool {
        self.shared
            .lock_index()
            .tables
            .iter()
            .all(OffsetTable::is_complete)
    }

    /// Offset tables of every source, 0 for unknown entries.
    pub fn export_offsets(&self) -> Vec<Vec<u64>> {
        self.shared
            .lock_index()
            .tables
            .iter()
            .map(OffsetTable::export)
            .collect()
    }

    /// Check that every known offset follows a restart marker.
    ///
    /// Returns (source, unit) pairs of bad entries.
    pub fn verify_offsets(&self) -> Result<Vec<(usize, usize)>, SlideError> {
        let state = self.shared.lock_index();
        let mut bad = Vec::new();
        for (index, (source, table)) in self.shared.sources.iter().zip(&state.tables).enumerate() {
            for unit in locator::verify_offsets(source.reader.as_ref(), table)? {
                bad.push((index, unit));
            }
        }
        Ok(bad)
    }

    /// Byte range backing a tile, locating it if necessary.
    pub fn tile_byte_range(&self, level: usize, col: u32, row: u32) -> Result<TileByteRange, SlideError> {
        let location = self.locate(level, col, row)?;
        let (start, stop) = self.unit_range(location.source, location.unit)?;

        Ok(TileByteRange {
            source: location.source,
            unit: location.unit,
            start,
            stop,
            scale_denom: location.scale_denom,
        })
    }

    fn level(&self, level: usize) -> Result<&PyramidLevel, SlideError> {
        self.levels.get(level).ok_or(SlideError::InvalidLevel {
            level,
            level_count: self.levels.len(),
        })
    }

    /// Map a tile of a level to its source file and restart unit.
    fn locate(&self, level: usize, col: u32, row: u32) -> Result<TileLocation, SlideError> {
        let lvl = self.level(level)?;
        let first = &self.shared.sources[lvl.sources[0]].geometry;

        // Unscaled pixel position of the tile
        let src_x = col as u64 * first.tile_width as u64;
        let src_y = row as u64 * first.tile_height as u64;

        let file_x = src_x / lvl.image00_width as u64;
        let file_y = src_y / lvl.image00_height as u64;
        if file_x >= lvl.sources_across as u64 || file_y >= lvl.sources_down as u64 {
            return Err(SlideError::InvalidLevel {
                level,
                level_count: self.levels.len(),
            });
        }

        let source = lvl.sources[(file_y * lvl.sources_across as u64 + file_x) as usize];
        let geometry = &self.shared.sources[source].geometry;
        let start_x = src_x - file_x * lvl.image00_width as u64;
        let start_y = src_y - file_y * lvl.image00_height as u64;

        let unit = (start_y / geometry.tile_height as u64) * geometry.units_per_row as u64
            + start_x / geometry.tile_width as u64;

        Ok(TileLocation {
            source,
            unit: unit as usize,
            scale_denom: lvl.scale_denom,
        })
    }

    fn unit_range(&self, source: usize, unit: usize) -> Result<(u64, u64), SlideError> {
        let reader = self.shared.sources[source].reader.as_ref();
        let mut state = self.shared.lock_index();
        locator::unit_range(reader, &mut state.tables[source], unit)?
            .ok_or(SlideError::TileUnavailable {
                source_index: source,
                unit,
            })
    }
}

impl Drop for TiledJpegSlide {
    fn drop(&mut self) {
        self.shared.lock_index().should_terminate = true;

        let handle = self
            .indexer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Background indexer panicked");
            }
        }
    }
}

impl TileSource for TiledJpegSlide {
    fn level_count(&self) -> usize {
        self.levels.len()
    }

    fn grid(&self, level: usize) -> Option<GridGeometry> {
        let lvl = self.levels.get(level)?;
        let first = &self.shared.sources[lvl.sources[0]].geometry;
        Some(GridGeometry::covering(
            lvl.width(),
            lvl.height(),
            (first.tile_width / lvl.scale_denom).max(1),
            (first.tile_height / lvl.scale_denom).max(1),
        ))
    }

    fn cache(&self) -> &TileCache {
        &self.cache
    }

    fn decode_lock(&self, level: usize, col: u32, row: u32) -> Result<&Mutex<()>, SlideError> {
        let location = self.locate(level, col, row)?;
        Ok(&self.shared.sources[location.source].decode_lock)
    }

    fn decode_tile(&self, level: usize, col: u32, row: u32) -> Result<TileBuffer, SlideError> {
        let location = self.locate(level, col, row)?;
        let (start, stop) = self.unit_range(location.source, location.unit)?;

        let source = &self.shared.sources[location.source];
        let unit_data = source.reader.read_exact_at(start, (stop - start) as usize)?;
        let stream = build_tile_stream(
            &source.header,
            &source.header_bytes,
            &unit_data,
            source.geometry.tile_width,
            source.geometry.tile_height,
        )?;

        let (pixels, width, height) = self.decoder.decode_scaled(
            &stream,
            source.geometry.tile_width,
            source.geometry.tile_height,
            location.scale_denom,
        )?;
        Ok(TileBuffer::new(pixels, width, height))
    }
}

impl SlideReader for TiledJpegSlide {
    fn level_downsample(&self, level: usize) -> Option<f64> {
        self.levels.get(level).map(PyramidLevel::downsample)
    }

    fn to_level_coords(&self, level: usize, x: i64, y: i64) -> Option<(i64, i64)> {
        let lvl = self.levels.get(level)?;
        Some((lvl.to_level_coord(x), lvl.to_level_coord(y)))
    }

    fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    fn comment(&self) -> Option<&str> {
        self.shared.sources.first()?.header.comment.as_deref()
    }
}

// =============================================================================
// Open-Time Checks
// =============================================================================

/// Files of a level must share one tile size, and every file except the last
/// column/row must match the size of file (0, 0).
fn check_level_geometry(level: &PyramidLevel, sources: &[JpegSource]) -> Result<(), FormatError> {
    let first = &sources[level.sources[0]].geometry;

    for (i, &index) in level.sources.iter().enumerate() {
        let source = &sources[index];
        let col = i as u32 % level.sources_across;
        let row = i as u32 / level.sources_across;

        if (source.geometry.tile_width, source.geometry.tile_height)
            != (first.tile_width, first.tile_height)
        {
            return Err(FormatError::Geometry(format!(
                "{} has {}x{} tiles, expected {}x{}",
                source.reader.identifier(),
                source.geometry.tile_width,
                source.geometry.tile_height,
                first.tile_width,
                first.tile_height
            )));
        }
        if col + 1 < level.sources_across && source.header.width != level.image00_width {
            return Err(FormatError::Geometry(format!(
                "{} is {} pixels wide, expected {}",
                source.reader.identifier(),
                source.header.width,
                level.image00_width
            )));
        }
        if row + 1 < level.sources_down && source.header.height != level.image00_height {
            return Err(FormatError::Geometry(format!(
                "{} is {} pixels high, expected {}",
                source.reader.identifier(),
                source.header.height,
                level.image00_height
            )));
        }
    }

    if level.image00_width % first.tile_width != 0 || level.image00_height % first.tile_height != 0 {
        return Err(FormatError::Geometry(format!(
            "file size {}x{} is not a multiple of the tile size {}x{}",
            level.image00_width, level.image00_height, first.tile_width, first.tile_height
        )));
    }

    Ok(())
}

/// SHA-256 over the headers of every level-0 file.
fn quickhash(placements: &[TilePlacement], sources: &[JpegSource]) -> String {
    let mut hasher = Sha256::new();
    for placement in placements.iter().filter(|p| p.coord.level == 0) {
        hasher.update(&sources[placement.source].header_bytes);
    }
    hex::encode(hasher.finalize())
}

// =============================================================================
// Background Indexer
// =============================================================================

fn spawn_indexer(shared: Arc<Shared>) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("wsi-restart-indexer".to_string())
        .spawn(move || {
            let started = Instant::now();
            if index_all(&shared) {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Background indexing finished");
            }
        });

    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Could not start background indexer");
            None
        }
    }
}

/// Ensure every unit offset of every source, one lock acquisition per unit.
///
/// Returns false if stopped by the termination flag.
fn index_all(shared: &Shared) -> bool {
    for (index, source) in shared.sources.iter().enumerate() {
        for unit in 0..source.geometry.unit_count as usize {
            let mut state = shared.lock_index();
            if state.should_terminate {
                debug!("Background indexer stopping");
                return false;
            }

            match locator::ensure_offset(source.reader.as_ref(), &mut state.tables[index], unit) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(source = source.reader.identifier(), unit, "Restart unit not found");
                }
                Err(e) => {
                    debug!(source = source.reader.identifier(), unit, error = %e, "Indexing read failed");
                }
            }
        }
    }
    true
}
