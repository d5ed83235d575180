//! Options applied when a slide is opened.

use std::fmt;
use std::sync::Arc;

use crate::tile::{ImageJpegDecoder, TileDecoder, DEFAULT_TILE_CACHE_CAPACITY};

/// Per-slide settings.
///
/// ```
/// use wsi_pyramid::SlideOptions;
///
/// let options = SlideOptions::default()
///     .with_cache_capacity(16 * 1024 * 1024)
///     .with_background_indexing(false);
/// assert_eq!(options.cache_capacity, 16 * 1024 * 1024);
/// ```
#[derive(Clone)]
pub struct SlideOptions {
    /// Tile cache budget in bytes
    pub cache_capacity: usize,

    /// Start a thread that indexes restart markers while the slide is open
    pub background_indexing: bool,

    /// Decoder used for every tile
    pub decoder: Arc<dyn TileDecoder>,
}

impl SlideOptions {
    pub fn with_cache_capacity(mut self, bytes: usize) -> Self {
        self.cache_capacity = bytes;
        self
    }

    pub fn with_background_indexing(mut self, enabled: bool) -> Self {
        self.background_indexing = enabled;
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn TileDecoder>) -> Self {
        self.decoder = decoder;
        self
    }
}

impl Default for SlideOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_TILE_CACHE_CAPACITY,
            background_indexing: true,
            decoder: Arc::new(ImageJpegDecoder::new()),
        }
    }
}

impl fmt::Debug for SlideOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlideOptions")
            .field("cache_capacity", &self.cache_capacity)
            .field("background_indexing", &self.background_indexing)
            .finish_non_exhaustive()
    }
}
