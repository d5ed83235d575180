//! Tile cache for decoded pixel buffers.
//!
//! Each slide owns one cache, sized when the slide is opened. Entries are
//! decoded tiles keyed by (level, column, row).
//!
//! # References
//!
//! `get` and `put` hand out `Arc<TileBuffer>` clones. Holding the `Arc` is
//! the reference: while any clone is alive the entry is pinned and eviction
//! skips it. Dropping the last outside clone makes it evictable again.
//!
//! # Size-Based Eviction
//!
//! The cache tracks the total size of cached tiles in bytes and evicts the
//! least-recently-used unpinned entries when the capacity is exceeded. If
//! every entry is pinned the cache stays over budget until references are
//! released. A tile larger than the whole capacity is returned to the caller
//! but never stored.
//!
//! The cache is a passive store. Avoiding duplicate decodes of one tile is
//! the grid reader's job.

use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

/// Default cache capacity: 64MB
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 64 * 1024 * 1024;

// =============================================================================
// Cache Key and Value
// =============================================================================

/// Cache key for decoded tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    /// Level index within the slide
    pub level: usize,

    /// Tile column
    pub col: u32,

    /// Tile row
    pub row: u32,
}

impl TileKey {
    pub fn new(level: usize, col: u32, row: u32) -> Self {
        Self { level, col, row }
    }
}

/// A decoded tile: ARGB pixels in row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileBuffer {
    pub pixels: Vec<u32>,
    pub width: u32,
    pub height: u32,
}

impl TileBuffer {
    pub fn new(pixels: Vec<u32>, width: u32, height: u32) -> Self {
        debug_assert_eq!(pixels.len(), width as usize * height as usize);
        Self {
            pixels,
            width,
            height,
        }
    }

    /// Size of the pixel data in bytes.
    pub fn size_bytes(&self) -> usize {
        self.pixels.len() * std::mem::size_of::<u32>()
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

// =============================================================================
// Tile Cache
// =============================================================================

struct CacheState {
    entries: LruCache<TileKey, Arc<TileBuffer>>,
    current_size: usize,
    stats: CacheStats,
}

/// LRU cache for decoded tiles with size-based capacity.
///
/// # Thread Safety
///
/// One mutex guards the index. It is held only while entries are looked up,
/// inserted or evicted, never across a decode.
pub struct TileCache {
    state: Mutex<CacheState>,
    max_size: usize,
}

impl TileCache {
    /// Create a new tile cache with default capacity (64MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TILE_CACHE_CAPACITY)
    }

    /// Create a new tile cache with the specified capacity in bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                current_size: 0,
                stats: CacheStats::default(),
            }),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // A panic while holding the lock leaves only counters in doubt
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a tile, marking it most recently used.
    pub fn get(&self, key: &TileKey) -> Option<Arc<TileBuffer>> {
        let mut state = self.lock();
        match state.entries.get(key).cloned() {
            Some(tile) => {
                state.stats.hits += 1;
                Some(tile)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Store a tile and return a reference to it.
    ///
    /// Unpinned entries are evicted in LRU order until the new tile fits.
    pub fn put(&self, key: TileKey, tile: TileBuffer) -> Arc<TileBuffer> {
        let tile = Arc::new(tile);
        let size = tile.size_bytes();
        if size > self.max_size {
            return tile;
        }

        let mut state = self.lock();

        if let Some(old) = state.entries.pop(&key) {
            state.current_size -= old.size_bytes();
        }

        while state.current_size + size > self.max_size {
            let victim = state
                .entries
                .iter()
                .rev()
                .find(|(_, value)| Arc::strong_count(value) == 1)
                .map(|(k, _)| *k);

            let Some(victim) = victim else {
                break;
            };
            if let Some(evicted) = state.entries.pop(&victim) {
                state.current_size -= evicted.size_bytes();
                state.stats.evictions += 1;
            }
        }

        state.entries.put(key, Arc::clone(&tile));
        state.current_size += size;
        tile
    }

    /// Check if a tile is cached without touching its recency.
    pub fn contains(&self, key: &TileKey) -> bool {
        self.lock().entries.contains(key)
    }

    /// Remove a tile from the cache.
    pub fn remove(&self, key: &TileKey) -> Option<Arc<TileBuffer>> {
        let mut state = self.lock();
        let removed = state.entries.pop(key);
        if let Some(tile) = &removed {
            state.current_size -= tile.size_bytes();
        }
        removed
    }

    /// Remove every tile.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.current_size = 0;
    }

    /// Number of cached tiles.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of cached tiles in bytes.
    pub fn size(&self) -> usize {
        self.lock().current_size
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Snapshot of the hit, miss and eviction counters.
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("TileCache")
            .field("entries", &state.entries.len())
            .field("current_size", &state.current_size)
            .field("max_size", &self.max_size)
            .finish()
    }
}
