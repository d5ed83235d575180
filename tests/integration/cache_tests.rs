//! Tile cache integration tests.
//!
//! Tests verify:
//! - Concurrent readers decode each tile once
//! - Repeated reads are served from the cache
//! - A small budget evicts tiles that are no longer in use

use std::sync::Arc;
use std::thread;

use wsi_pyramid::{Slide, SlideOptions};

use super::test_utils::{close, gray, write_tiled_jpeg_slide, CountingDecoder};

#[test]
fn test_concurrent_readers_decode_each_tile_once() {
    let fixture = write_tiled_jpeg_slide(2, 256, 256, 8, None);
    let decoder = CountingDecoder::new();
    let options = SlideOptions::default().with_decoder(decoder.clone());
    let slide = Arc::new(Slide::open(&fixture.key_file, &options).unwrap());

    // 128x16 at the origin covers tiles (0..2, 0..2)
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let slide = Arc::clone(&slide);
            thread::spawn(move || {
                let mut dest = vec![0u32; 128 * 16];
                slide.read_region(&mut dest, 0, 0, 0, 128, 16).unwrap();
                dest
            })
        })
        .collect();

    let results: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(decoder.decode_count(), 4);
    for dest in &results {
        assert_eq!(dest, &results[0]);
    }
    assert!(close(gray(results[0][0]), fixture.expected_shade(0, 0)));
    assert!(close(gray(results[0][127]), fixture.expected_shade(127, 0)));
}

#[test]
fn test_overlapping_regions_share_tiles() {
    let fixture = write_tiled_jpeg_slide(2, 256, 256, 8, None);
    let decoder = CountingDecoder::new();
    let options = SlideOptions::default().with_decoder(decoder.clone());
    let slide = Arc::new(Slide::open(&fixture.key_file, &options).unwrap());

    // Regions offset by a few pixels all fall within tiles (0..3, 0..3)
    thread::scope(|scope| {
        for offset in 0..6u32 {
            let slide = &slide;
            scope.spawn(move || {
                let mut dest = vec![0u32; 100 * 10];
                slide
                    .read_region(&mut dest, offset as i64 * 10, offset as i64, 0, 100, 10)
                    .unwrap();
            });
        }
    });

    // x spans 0..150 (cols 0, 1, 2), y spans 0..15 (rows 0, 1)
    assert_eq!(decoder.decode_count(), 6);
}

#[test]
fn test_repeated_read_hits_cache() {
    let fixture = write_tiled_jpeg_slide(1, 256, 64, 8, None);
    let decoder = CountingDecoder::new();
    let options = SlideOptions::default().with_decoder(decoder.clone());
    let slide = Slide::open(&fixture.key_file, &options).unwrap();

    let mut first = vec![0u32; 64 * 8];
    slide.read_region(&mut first, 64, 8, 0, 64, 8).unwrap();
    let misses = slide.cache_stats().misses;

    let mut second = vec![0u32; 64 * 8];
    slide.read_region(&mut second, 64, 8, 0, 64, 8).unwrap();

    assert_eq!(first, second);
    assert_eq!(decoder.decode_count(), 1);

    let stats = slide.cache_stats();
    assert_eq!(stats.misses, misses);
    assert!(stats.hits >= 1);
}

#[test]
fn test_small_budget_evicts() {
    let fixture = write_tiled_jpeg_slide(1, 256, 64, 8, None);
    let decoder = CountingDecoder::new();

    // One 64x8 ARGB tile is 2 KiB; room for two
    let options = SlideOptions::default()
        .with_decoder(decoder.clone())
        .with_cache_capacity(2 * 64 * 8 * 4);
    let slide = Slide::open(&fixture.key_file, &options).unwrap();

    let mut dest = vec![0u32; 256 * 8];
    slide.read_region(&mut dest, 0, 0, 0, 256, 8).unwrap();
    assert_eq!(decoder.decode_count(), 4);
    assert_eq!(slide.cache_stats().evictions, 2);

    // The first tile was evicted and decodes again
    let mut dest = vec![0u32; 1];
    slide.read_region(&mut dest, 0, 0, 0, 1, 1).unwrap();
    assert_eq!(decoder.decode_count(), 5);
    assert!(close(gray(dest[0]), fixture.expected_shade(0, 0)));
}
