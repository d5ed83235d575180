//! Multi-file assembly and format detection tests.
//!
//! Tests verify:
//! - Members of one series are picked out of a shared directory
//! - A requested file that is not a member is rejected
//! - DICOM candidates are screened by magic before parsing
//! - Format detection by extension and content

use std::collections::HashMap;
use std::path::Path;

use wsi_pyramid::format::DicomOpener;
use wsi_pyramid::slide::{assemble_members, MemberOpener, TagReader};
use wsi_pyramid::{
    detect_format, sniff_container, ContainerHint, FormatError, Slide, SlideError, SlideFormat,
    SlideOptions,
};

// =============================================================================
// Fake Members
// =============================================================================

#[derive(Debug, Clone, Default)]
struct Member {
    ints: HashMap<&'static str, i64>,
    strings: HashMap<&'static str, Vec<String>>,
}

impl TagReader for Member {
    fn get_int(&self, keyword: &str) -> Option<i64> {
        self.ints.get(keyword).copied()
    }

    fn get_string(&self, keyword: &str, index: usize) -> Option<String> {
        self.strings.get(keyword)?.get(index).cloned()
    }
}

fn level(series: &str, width: i64) -> Member {
    let mut m = Member::default();
    m.strings.insert("SeriesInstanceUID", vec![series.to_string()]);
    m.strings.insert(
        "ImageType",
        ["DERIVED", "PRIMARY", "VOLUME", "RESAMPLED"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    m.ints.insert("TotalPixelMatrixColumns", width);
    m.ints.insert("TotalPixelMatrixRows", width * 3 / 4);
    m.ints.insert("Columns", 512);
    m.ints.insert("Rows", 512);
    m.ints.insert("NumberOfFrames", 64);
    m
}

/// Reads members from files holding `series,width`.
struct TextOpener;

impl MemberOpener for TextOpener {
    type Member = Member;

    fn open_member(&self, path: &Path) -> Result<Member, FormatError> {
        let text = std::fs::read_to_string(path).map_err(|e| FormatError::UnsupportedFormat {
            reason: e.to_string(),
        })?;
        let (series, width) = text
            .trim()
            .split_once(',')
            .ok_or_else(|| FormatError::UnsupportedFormat {
                reason: "not a member".to_string(),
            })?;
        let width = width.parse().map_err(|_| FormatError::UnsupportedFormat {
            reason: "bad width".to_string(),
        })?;
        Ok(level(series, width))
    }
}

fn write(dir: &tempfile::TempDir, name: &str, contents: &str) {
    std::fs::write(dir.path().join(name), contents).unwrap();
}

// =============================================================================
// Assembly
// =============================================================================

#[test]
fn test_series_members_become_levels() {
    let dir = tempfile::tempdir().unwrap();
    write(&dir, "level_0.dcm", "1.2.840.1,40000");
    write(&dir, "level_1.dcm", "1.2.840.1,10000");
    write(&dir, "level_2.dcm", "1.2.840.1,20000");
    write(&dir, "other_0.dcm", "1.2.840.2,40000");
    write(&dir, "other_1.dcm", "1.2.840.2,5000");
    write(&dir, "README", "scanner export");

    let slide = assemble_members(&TextOpener, &dir.path().join("level_2.dcm")).unwrap();

    assert_eq!(slide.series_uid, "1.2.840.1");
    let widths: Vec<u32> = slide.levels.iter().map(|l| l.width).collect();
    assert_eq!(widths, vec![40000, 20000, 10000]);
    assert_eq!(slide.levels[2].downsample, 4.0);

    // 40000x30000 in 512 px tiles
    assert_eq!(slide.levels[0].tiles_across, 79);
    assert_eq!(slide.levels[0].tiles_down, 59);
    assert!(slide.associated.is_empty());
}

#[test]
fn test_requested_non_member_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(&dir, "level_0.dcm", "1.2.840.1,40000");
    write(&dir, "README", "scanner export");

    let result = assemble_members(&TextOpener, &dir.path().join("README"));
    assert!(matches!(result, Err(FormatError::RequestedFileRejected(_))));
}

// =============================================================================
// DICOM Screening
// =============================================================================

/// 128-byte preamble followed by the DICOM magic and junk.
fn fake_dicom_bytes() -> Vec<u8> {
    let mut data = vec![0u8; 128];
    data.extend_from_slice(b"DICM");
    data.extend_from_slice(&[0xAB; 32]);
    data
}

#[test]
fn test_dicom_opener_rejects_files_without_magic() {
    let dir = tempfile::tempdir().unwrap();
    write(&dir, "notes.dcm", "not dicom at all");

    let result = DicomOpener.open_member(&dir.path().join("notes.dcm"));
    assert!(matches!(result, Err(FormatError::UnsupportedFormat { .. })));
}

#[test]
fn test_dicom_opener_rejects_corrupt_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.dcm");
    std::fs::write(&path, fake_dicom_bytes()).unwrap();

    assert!(DicomOpener.open_member(&path).is_err());
}

#[test]
fn test_detect_dicom_by_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image");
    std::fs::write(&path, fake_dicom_bytes()).unwrap();

    let hint = sniff_container(&path).unwrap();
    assert_eq!(hint, ContainerHint::Unknown);
    assert_eq!(detect_format(&path, hint).unwrap(), SlideFormat::Dicom);
}

#[test]
fn test_detect_tiff_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slide.tif");
    std::fs::write(&path, [0x49, 0x49, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00]).unwrap();

    let hint = sniff_container(&path).unwrap();
    assert_eq!(hint, ContainerHint::TaggedContainer);
    assert!(matches!(
        detect_format(&path, hint),
        Err(FormatError::UnsupportedFormat { .. })
    ));
}

#[test]
fn test_open_corrupt_dicom_slide_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("level_0.dcm");
    std::fs::write(&path, fake_dicom_bytes()).unwrap();

    let result = Slide::open(&path, &SlideOptions::default());
    assert!(matches!(
        result,
        Err(SlideError::Format(FormatError::RequestedFileRejected(_)))
    ));
}
