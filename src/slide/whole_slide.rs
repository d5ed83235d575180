//! The `Slide` handle: one opened slide, whatever its format.
//!
//! Opening detects the format, builds the backend, and precomputes the
//! common properties. Every query after that is answered from memory except
//! region and associated image reads.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::error::SlideError;
use crate::format::{
    detect_format, sniff_container, DicomSlide, SlideFormat, TiledJpegSlide,
};
use crate::tile::{CacheStats, TileBuffer};

use super::options::SlideOptions;
use super::reader::{LevelInfo, SlideReader};

/// Format-specific backend.
///
/// A closed set of backends, so an enum rather than a boxed trait object.
enum SlideInner {
    TiledJpeg(TiledJpegSlide),
    Dicom(DicomSlide),
}

/// An open whole slide image.
///
/// `Slide` is `Send + Sync`; share it behind an `Arc` to read regions from
/// several threads at once.
pub struct Slide {
    format: SlideFormat,
    inner: SlideInner,
    properties: BTreeMap<String, String>,
}

impl Slide {
    /// Open the slide at `path`, detecting its format.
    pub fn open(path: impl AsRef<Path>, options: &SlideOptions) -> Result<Self, SlideError> {
        let path = path.as_ref();
        let hint = sniff_container(path)?;
        let format = detect_format(path, hint)?;
        debug!(path = %path.display(), format = format.name(), "Detected slide format");

        let inner = match format {
            SlideFormat::TiledJpeg => SlideInner::TiledJpeg(TiledJpegSlide::open(path, options)?),
            SlideFormat::Dicom => SlideInner::Dicom(DicomSlide::open(path, options)?),
        };
        Ok(Self::from_inner(format, inner))
    }

    /// Wrap an already opened tiled JPEG slide.
    pub fn from_tiled_jpeg(slide: TiledJpegSlide) -> Self {
        Self::from_inner(SlideFormat::TiledJpeg, SlideInner::TiledJpeg(slide))
    }

    fn from_inner(format: SlideFormat, inner: SlideInner) -> Self {
        let mut slide = Self {
            format,
            inner,
            properties: BTreeMap::new(),
        };
        slide.properties = slide.collect_properties();
        slide
    }

    fn collect_properties(&self) -> BTreeMap<String, String> {
        let reader = self.reader();
        let mut properties = reader.properties().clone();

        properties.insert("wsi.vendor".to_string(), self.format.vendor().to_string());
        properties.insert("wsi.level-count".to_string(), reader.level_count().to_string());
        for level in 0..reader.level_count() {
            let Some(info) = reader.level_info(level) else {
                continue;
            };
            let prefix = format!("wsi.level[{}]", level);
            properties.insert(format!("{}.width", prefix), info.width.to_string());
            properties.insert(format!("{}.height", prefix), info.height.to_string());
            properties.insert(format!("{}.downsample", prefix), info.downsample.to_string());
            properties.insert(format!("{}.tile-width", prefix), info.tile_width.to_string());
            properties.insert(format!("{}.tile-height", prefix), info.tile_height.to_string());
        }
        properties
    }

    fn reader(&self) -> &dyn SlideReader {
        match &self.inner {
            SlideInner::TiledJpeg(s) => s,
            SlideInner::Dicom(s) => s,
        }
    }

    /// Get the detected format of this slide.
    pub fn format(&self) -> SlideFormat {
        self.format
    }

    /// The tiled JPEG backend, for index maintenance.
    pub fn as_tiled_jpeg(&self) -> Option<&TiledJpegSlide> {
        match &self.inner {
            SlideInner::TiledJpeg(s) => Some(s),
            SlideInner::Dicom(_) => None,
        }
    }

    /// Get the number of pyramid levels.
    pub fn level_count(&self) -> usize {
        self.reader().level_count()
    }

    /// Get dimensions of the full-resolution (level 0) image.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.reader().dimensions()
    }

    /// Get dimensions of a specific level.
    pub fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.reader().level_dimensions(level)
    }

    /// Get the downsample factor for a level.
    pub fn level_downsample(&self, level: usize) -> Option<f64> {
        self.reader().level_downsample(level)
    }

    /// Get tile size for a level.
    pub fn tile_size(&self, level: usize) -> Option<(u32, u32)> {
        self.reader().tile_size(level)
    }

    /// Get the number of tiles in X and Y directions for a level.
    pub fn tile_count(&self, level: usize) -> Option<(u32, u32)> {
        self.reader().tile_count(level)
    }

    /// Get complete information about a level.
    pub fn level_info(&self, level: usize) -> Option<LevelInfo> {
        self.reader().level_info(level)
    }

    /// Find the best level for a given downsample factor.
    pub fn best_level_for_downsample(&self, downsample: f64) -> Option<usize> {
        self.reader().best_level_for_downsample(downsample)
    }

    /// All properties, backend-specific and common.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// A single property value.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Free-text comment embedded in the slide.
    pub fn comment(&self) -> Option<&str> {
        self.reader().comment()
    }

    /// Names of the associated images.
    pub fn associated_image_names(&self) -> Vec<String> {
        self.reader().associated_image_names()
    }

    /// Decode an associated image.
    pub fn read_associated_image(&self, name: &str) -> Result<TileBuffer, SlideError> {
        self.reader().read_associated_image(name)
    }

    /// Read a region into `dest` as premultiplied ARGB.
    ///
    /// # Arguments
    /// * `x`, `y` - Top-left pixel in level-0 coordinates
    /// * `level` - Pyramid level to read from
    /// * `width`, `height` - Output size in pixels of `level`
    ///
    /// `dest` must hold at least `width * height` pixels. Pixels outside the
    /// slide are 0. On error `dest` is left untouched.
    pub fn read_region(
        &self,
        dest: &mut [u32],
        x: i64,
        y: i64,
        level: usize,
        width: u32,
        height: u32,
    ) -> Result<(), SlideError> {
        self.reader().read_region(dest, x, y, level, width, height)
    }

    /// Read a region whose top-left pixel `(x, y)` is in `level`'s own pixel
    /// space rather than level 0's.
    pub fn read_level_region(
        &self,
        dest: &mut [u32],
        level: usize,
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    ) -> Result<(), SlideError> {
        self.reader()
            .read_level_region(dest, level, x, y, width, height)
    }

    /// Tile cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.reader().cache().stats()
    }
}

impl std::fmt::Debug for Slide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slide")
            .field("format", &self.format)
            .field("levels", &self.level_count())
            .field("dimensions", &self.dimensions())
            .finish_non_exhaustive()
    }
}
