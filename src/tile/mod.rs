//! Tile layer.
//!
//! Tiles are the unit of decoding and caching. Backends expose each level as
//! a grid of tiles through [`TileSource`]; the grid reader composes regions
//! from them, decoding each tile at most once while it stays cached.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            RegionService                │
//! │   (async, runs reads on blocking pool)  │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │              Grid Reader                │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  TileCache   │  │  TileDecoder    │  │
//! │  │  (decoded    │  │  (JPEG → ARGB,  │  │
//! │  │   ARGB)      │  │   scaled)       │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │         TileSource (backends)           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use wsi_pyramid::tile::{TileBuffer, TileCache, TileKey};
//!
//! let cache = TileCache::with_capacity(1024 * 1024);
//! let key = TileKey::new(0, 1, 2);
//!
//! if cache.get(&key).is_none() {
//!     let tile = TileBuffer::new(vec![0xFF00_0000; 16 * 16], 16, 16);
//!     let held = cache.put(key, tile);
//!     assert_eq!(held.width, 16);
//! }
//! assert!(cache.contains(&key));
//! ```

mod cache;
mod decoder;
pub mod grid;
mod service;

pub use cache::{CacheStats, TileBuffer, TileCache, TileKey, DEFAULT_TILE_CACHE_CAPACITY};
pub use decoder::{downscale, pack_argb, ImageJpegDecoder, TileDecoder, SCALE_DENOMINATORS};
pub use grid::{GridGeometry, TileSource};
pub use service::{RegionRequest, RegionResponse, RegionService, DEFAULT_MAX_REGION_PIXELS};
