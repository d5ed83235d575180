//! Region service integration tests.
//!
//! Tests verify:
//! - Async region reads return the same pixels as direct reads
//! - Tiles and thumbnails come from the right level, including levels with
//!   fractional downsamples
//! - Requests are validated before any work is scheduled

use std::sync::Arc;

use wsi_pyramid::{RegionError, RegionRequest, RegionService, Slide, SlideError, SlideOptions};

use super::test_utils::{
    close, gray, write_tiled_jpeg_slide, DicomInstance, TiledJpegFixture, RESAMPLED, VOLUME,
};

fn service(fixture: &TiledJpegFixture) -> RegionService {
    let slide = Slide::open(&fixture.key_file, &SlideOptions::default()).unwrap();
    RegionService::new(Arc::new(slide))
}

#[tokio::test]
async fn test_get_region_matches_direct_read() {
    let fixture = write_tiled_jpeg_slide(2, 256, 256, 8, None);
    let service = service(&fixture);

    let region = service
        .get_region(RegionRequest::new(200, 40, 0, 120, 30))
        .await
        .unwrap();
    assert_eq!((region.width, region.height, region.level), (120, 30, 0));

    let mut direct = vec![0u32; 120 * 30];
    service
        .slide()
        .read_region(&mut direct, 200, 40, 0, 120, 30)
        .unwrap();
    assert_eq!(region.pixels, direct);
    assert!(close(gray(region.pixels[0]), fixture.expected_shade(200, 40)));
}

#[tokio::test]
async fn test_concurrent_requests() {
    let fixture = write_tiled_jpeg_slide(2, 256, 256, 8, None);
    let service = service(&fixture);

    let (a, b, c) = tokio::join!(
        service.get_region(RegionRequest::new(0, 0, 0, 64, 64)),
        service.get_region(RegionRequest::new(448, 192, 0, 64, 64)),
        service.get_region(RegionRequest::new(0, 0, 2, 32, 32)),
    );

    assert!(close(gray(a.unwrap().pixels[0]), fixture.expected_shade(0, 0)));
    assert!(close(gray(b.unwrap().pixels[0]), fixture.expected_shade(448, 192)));
    assert_eq!(c.unwrap().pixels.len(), 32 * 32);
}

#[tokio::test]
async fn test_get_tile() {
    let fixture = write_tiled_jpeg_slide(2, 256, 256, 8, None);
    let service = service(&fixture);

    // Level 0 tile (5, 3) covers x 320..384, y 24..32
    let tile = service.get_tile(0, 5, 3).await.unwrap();
    assert_eq!((tile.width, tile.height), (64, 8));
    assert!(tile
        .pixels
        .iter()
        .all(|&p| close(gray(p), fixture.expected_shade(320, 24))));

    // Level 2 tiles are 16x2
    let tile = service.get_tile(2, 7, 31).await.unwrap();
    assert_eq!((tile.width, tile.height, tile.level), (16, 2, 2));

    let result = service.get_tile(0, 8, 0).await;
    assert!(matches!(result, Err(RegionError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_get_tile_with_fractional_downsample() {
    let dir = tempfile::tempdir().unwrap();
    DicomInstance::level(VOLUME, 100, 100, 104, |_| 20).write(
        &dir.path().join("base.dcm"),
        "1.2.826.0.1.7",
        "1.2.826.0.1.7.1",
    );
    // 30x30 with 8x8 tiles: downsample 10/3
    DicomInstance::level(RESAMPLED, 30, 30, 8, |i| 20 + 12 * i as u8).write(
        &dir.path().join("small.dcm"),
        "1.2.826.0.1.7",
        "1.2.826.0.1.7.2",
    );
    let slide = Slide::open(dir.path().join("base.dcm"), &SlideOptions::default()).unwrap();
    let service = RegionService::new(Arc::new(slide));

    // Tile (2, 2) starts at level pixel 16, which is not a whole level-0 pixel
    let tile = service.get_tile(1, 2, 2).await.unwrap();
    assert_eq!((tile.width, tile.height, tile.level), (8, 8, 1));
    let expected = 20 + 12 * 10;
    assert!(tile.pixels.iter().all(|&p| close(gray(p), expected)));

    // Edge tile clipped to the 30-pixel level
    let edge = service.get_tile(1, 3, 3).await.unwrap();
    assert_eq!((edge.width, edge.height), (6, 6));
    assert!(edge.pixels.iter().all(|&p| close(gray(p), 20 + 12 * 15)));
}

#[tokio::test]
async fn test_thumbnail_uses_smallest_fitting_level() {
    let fixture = write_tiled_jpeg_slide(2, 256, 256, 8, None);
    let service = service(&fixture);

    let thumbnail = service.thumbnail(64).await.unwrap();
    assert_eq!(thumbnail.level, 3);
    assert_eq!((thumbnail.width, thumbnail.height), (64, 32));
    assert!(thumbnail.pixels.iter().all(|&p| p >> 24 == 0xFF));

    let thumbnail = service.thumbnail(300).await.unwrap();
    assert_eq!(thumbnail.level, 1);
    assert_eq!((thumbnail.width, thumbnail.height), (256, 128));
}

#[tokio::test]
async fn test_request_validation() {
    let fixture = write_tiled_jpeg_slide(1, 256, 64, 8, None);
    let slide = Slide::open(&fixture.key_file, &SlideOptions::default()).unwrap();
    let service = RegionService::with_max_region_pixels(Arc::new(slide), 1000);

    let result = service.get_region(RegionRequest::new(0, 0, 4, 10, 10)).await;
    assert!(matches!(
        result,
        Err(RegionError::InvalidLevel { level: 4, level_count: 4 })
    ));

    let result = service.get_region(RegionRequest::new(0, 0, 0, 0, 10)).await;
    assert!(matches!(result, Err(RegionError::InvalidRequest(_))));

    let result = service.get_region(RegionRequest::new(0, 0, 0, 100, 11)).await;
    assert!(matches!(result, Err(RegionError::InvalidRequest(_))));

    assert!(service.thumbnail(0).await.is_err());
}

#[tokio::test]
async fn test_tiled_jpeg_has_no_associated_images() {
    let fixture = write_tiled_jpeg_slide(1, 256, 64, 8, None);
    let service = service(&fixture);

    assert!(service.slide().associated_image_names().is_empty());
    let result = service.associated_image("label").await;
    assert!(matches!(
        result,
        Err(RegionError::Slide(SlideError::AssociatedImageNotFound(_)))
    ));
}
