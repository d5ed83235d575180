//! DICOM whole slide integration tests.
//!
//! Tests verify:
//! - A series written with the `dicom` crate opens as a two-level slide
//! - Tiles map to frames row by row and decode to the right pixels
//! - Label images are read from their own member
//! - Frames missing from the pixel data are errors, not blank tiles

use wsi_pyramid::{FormatError, Slide, SlideError, SlideFormat, SlideOptions};

use super::test_utils::{
    close, dicom_shade, gray, write_dicom_slide, DicomInstance, SERIES_UID, VOLUME,
};

fn open(dir: &tempfile::TempDir, name: &str) -> Slide {
    Slide::open(dir.path().join(name), &SlideOptions::default()).unwrap()
}

// =============================================================================
// Structure
// =============================================================================

#[test]
fn test_series_opens_as_pyramid() {
    let dir = write_dicom_slide();

    // Any member opens the whole series
    for name in ["level0.dcm", "level1.dcm", "label.dcm"] {
        let slide = open(&dir, name);
        assert_eq!(slide.format(), SlideFormat::Dicom);
        assert_eq!(slide.level_count(), 2);
    }

    let slide = open(&dir, "level1.dcm");
    assert_eq!(slide.level_dimensions(0), Some((64, 48)));
    assert_eq!(slide.level_dimensions(1), Some((32, 24)));
    assert_eq!(slide.level_downsample(1), Some(2.0));
    assert_eq!(slide.tile_size(0), Some((32, 32)));
    assert_eq!(slide.tile_count(0), Some((2, 2)));

    assert_eq!(slide.property("dicom.SeriesInstanceUID"), Some(SERIES_UID));
    assert_eq!(slide.property("dicom.Manufacturer"), Some("ACME"));
    assert_eq!(slide.property("wsi.quickhash-1").map(str::len), Some(64));
    assert_eq!(slide.associated_image_names(), vec!["label".to_string()]);
}

#[test]
fn test_non_member_rejected() {
    let dir = write_dicom_slide();
    let result = Slide::open(dir.path().join("notes.txt"), &SlideOptions::default());
    assert!(result.is_err());
}

// =============================================================================
// Frames
// =============================================================================

#[test]
fn test_tiles_map_to_frames_row_by_row() {
    let dir = write_dicom_slide();
    let slide = open(&dir, "level0.dcm");

    let mut dest = vec![0u32; 64 * 48];
    slide.read_region(&mut dest, 0, 0, 0, 64, 48).unwrap();

    for (x, y, frame) in [(5, 5, 0), (40, 5, 1), (5, 40, 2), (63, 47, 3), (31, 31, 0), (32, 32, 3)] {
        let pixel = dest[y * 64 + x];
        assert_eq!(pixel >> 24, 0xFF);
        assert!(
            close(gray(pixel), dicom_shade(frame)),
            "pixel ({}, {}): got {}, expected frame {}",
            x,
            y,
            gray(pixel),
            frame
        );
    }
}

#[test]
fn test_region_past_edge_is_transparent() {
    let dir = write_dicom_slide();
    let slide = open(&dir, "level0.dcm");

    // Level 1 is 32x24: its single frame is clipped below row 24
    let mut dest = vec![0xDEAD_BEEFu32; 8 * 8];
    slide.read_region(&mut dest, 56, 40, 1, 8, 8).unwrap();

    for y in 0..8 {
        for x in 0..8 {
            let pixel = dest[y * 8 + x];
            if x < 4 && y < 4 {
                assert!(close(gray(pixel), 200), "pixel ({}, {})", x, y);
            } else {
                assert_eq!(pixel, 0, "pixel ({}, {}) should be transparent", x, y);
            }
        }
    }
}

#[test]
fn test_associated_label() {
    let dir = write_dicom_slide();
    let slide = open(&dir, "level0.dcm");

    let label = slide.read_associated_image("label").unwrap();
    assert_eq!((label.width, label.height), (48, 32));
    assert!(label.pixels.iter().all(|&p| close(gray(p), 230)));

    assert!(matches!(
        slide.read_associated_image("overview"),
        Err(SlideError::AssociatedImageNotFound(_))
    ));
}

#[test]
fn test_tile_past_frame_count_is_error() {
    let dir = tempfile::tempdir().unwrap();

    // A 2x2 grid that only declares and holds three frames
    let mut level = DicomInstance::level(VOLUME, 64, 64, 32, dicom_shade);
    level.number_of_frames = 3;
    level.frames.truncate(3);
    level.write(&dir.path().join("short.dcm"), "1.2.826.0.1.5", "1.2.826.0.1.5.1");

    let slide = open(&dir, "short.dcm");

    let mut dest = vec![0u32; 32 * 32];
    slide.read_region(&mut dest, 0, 32, 0, 32, 32).unwrap();
    assert!(close(gray(dest[0]), dicom_shade(2)));

    let mut dest = vec![0xDEAD_BEEFu32; 32 * 32];
    let result = slide.read_region(&mut dest, 32, 32, 0, 32, 32);
    assert!(matches!(
        result,
        Err(SlideError::Format(FormatError::InvalidField { .. }))
    ));
    assert!(dest.iter().all(|&p| p == 0xDEAD_BEEF));
}

#[test]
fn test_missing_fragments_are_error() {
    let dir = tempfile::tempdir().unwrap();

    // Four frames declared, three fragments present, no offset table
    let mut level = DicomInstance::level(VOLUME, 64, 64, 32, dicom_shade);
    level.frames.truncate(3);
    level.write(&dir.path().join("truncated.dcm"), "1.2.826.0.1.6", "1.2.826.0.1.6.1");

    let slide = open(&dir, "truncated.dcm");

    let mut dest = vec![0u32; 32 * 32];
    let result = slide.read_region(&mut dest, 0, 0, 0, 32, 32);
    assert!(matches!(result, Err(SlideError::Format(FormatError::Dicom(_)))));
}
