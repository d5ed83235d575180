//! Test utilities for integration tests.
//!
//! This module writes small tiled JPEG slides to disk: grayscale baseline
//! JPEG files whose restart intervals each hold one flat gray tile, plus the
//! `.vms` key file that places them on a grid. It also writes DICOM whole
//! slide series with flat JPEG frames, and provides a decoder wrapper that
//! counts decodes.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dicom::core::value::PixelFragmentSequence;
use dicom::core::{DataElement, DicomValue, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::meta::FileMetaTableBuilder;
use dicom::object::InMemDicomObject;
use wsi_pyramid::error::DecodeError;
use wsi_pyramid::{ImageJpegDecoder, TileDecoder};

// =============================================================================
// Baseline JPEG Writer
// =============================================================================

/// Code lengths 1..=16 of the standard luminance DC table.
const DC_BITS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];

/// Symbols of the standard luminance DC table.
const DC_VALUES: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

/// Minimal AC table: EOB and one spare symbol, both 2-bit codes.
const AC_BITS: [u8; 16] = [0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
const AC_VALUES: [u8; 2] = [0x00, 0x01];

/// Canonical Huffman codes, indexed by symbol.
fn huffman_codes(bits: &[u8; 16], values: &[u8]) -> Vec<(u16, u8)> {
    let mut codes = vec![(0u16, 0u8); 256];
    let mut code = 0u16;
    let mut k = 0;
    for (i, &count) in bits.iter().enumerate() {
        let len = i as u8 + 1;
        for _ in 0..count {
            codes[values[k] as usize] = (code, len);
            code += 1;
            k += 1;
        }
        code <<= 1;
    }
    codes
}

/// MSB-first bit writer with 0xFF byte stuffing.
struct BitWriter {
    out: Vec<u8>,
    acc: u32,
    nbits: u32,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            out: Vec::new(),
            acc: 0,
            nbits: 0,
        }
    }

    fn put(&mut self, value: u32, len: u32) {
        for i in (0..len).rev() {
            self.acc = (self.acc << 1) | ((value >> i) & 1);
            self.nbits += 1;
            if self.nbits == 8 {
                self.emit();
            }
        }
    }

    fn emit(&mut self) {
        let byte = self.acc as u8;
        self.out.push(byte);
        if byte == 0xFF {
            self.out.push(0x00);
        }
        self.acc = 0;
        self.nbits = 0;
    }

    /// Pad to a byte boundary with 1 bits.
    fn flush(&mut self) {
        while self.nbits != 0 {
            self.put(1, 1);
        }
    }
}

fn magnitude(diff: i32) -> (u32, u32) {
    if diff == 0 {
        return (0, 0);
    }
    let size = 32 - diff.unsigned_abs().leading_zeros();
    let bits = if diff > 0 {
        diff as u32
    } else {
        (diff + (1 << size) - 1) as u32
    };
    (size, bits)
}

fn segment(out: &mut Vec<u8>, marker: u8, payload: &[u8]) {
    out.extend_from_slice(&[0xFF, marker]);
    out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Write a grayscale baseline JPEG where restart interval `i` is a flat tile
/// of gray `shade(i)`.
///
/// The image is `width` x `height` with `interval` MCUs (8x8 blocks) per
/// restart interval; `width` must be a multiple of `8 * interval` and
/// `height` a multiple of 8.
pub fn restart_jpeg(
    width: u16,
    height: u16,
    interval: u16,
    comment: Option<&str>,
    shade: impl Fn(usize) -> u8,
) -> Vec<u8> {
    assert_eq!(width % (8 * interval), 0);
    assert_eq!(height % 8, 0);

    let mut out = vec![0xFF, 0xD8];
    if let Some(comment) = comment {
        segment(&mut out, 0xFE, comment.as_bytes());
    }

    let mut dqt = vec![0x00];
    dqt.extend_from_slice(&[1u8; 64]);
    segment(&mut out, 0xDB, &dqt);

    let mut sof = vec![8];
    sof.extend_from_slice(&height.to_be_bytes());
    sof.extend_from_slice(&width.to_be_bytes());
    sof.extend_from_slice(&[1, 1, 0x11, 0]);
    segment(&mut out, 0xC0, &sof);

    let mut dht = vec![0x00];
    dht.extend_from_slice(&DC_BITS);
    dht.extend_from_slice(&DC_VALUES);
    segment(&mut out, 0xC4, &dht);

    let mut dht = vec![0x10];
    dht.extend_from_slice(&AC_BITS);
    dht.extend_from_slice(&AC_VALUES);
    segment(&mut out, 0xC4, &dht);

    segment(&mut out, 0xDD, &interval.to_be_bytes());
    segment(&mut out, 0xDA, &[1, 1, 0x00, 0, 63, 0]);

    let dc_codes = huffman_codes(&DC_BITS, &DC_VALUES);
    let ac_codes = huffman_codes(&AC_BITS, &AC_VALUES);
    let (eob, eob_len) = ac_codes[0];

    let units = (width as usize / 8 / interval as usize) * (height as usize / 8);
    for unit in 0..units {
        let mut bits = BitWriter::new();
        let dc = (shade(unit) as i32 - 128) * 8;

        // The predictor resets at every restart, so only the first block
        // carries a difference
        for block in 0..interval {
            let diff = if block == 0 { dc } else { 0 };
            let (size, extra) = magnitude(diff);
            let (code, len) = dc_codes[size as usize];
            bits.put(code as u32, len as u32);
            bits.put(extra, size);
            bits.put(eob as u32, eob_len as u32);
        }
        bits.flush();
        out.extend_from_slice(&bits.out);

        if unit + 1 < units {
            out.extend_from_slice(&[0xFF, 0xD0 + (unit % 8) as u8]);
        }
    }

    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

/// Deterministic, well-spread gray for a tile of a file.
pub fn tile_shade(file: usize, unit: usize) -> u8 {
    ((file * 97 + unit * 37 + 20) % 216) as u8 + 20
}

/// Whether two gray levels agree within decoder rounding.
pub fn close(a: u8, b: u8) -> bool {
    (a as i16 - b as i16).abs() <= 2
}

/// Gray component of an ARGB pixel.
pub fn gray(pixel: u32) -> u8 {
    (pixel & 0xFF) as u8
}

// =============================================================================
// Slide Fixtures
// =============================================================================

/// A tiled JPEG slide written to a temporary directory.
pub struct TiledJpegFixture {
    pub dir: tempfile::TempDir,
    pub key_file: PathBuf,
    pub columns: usize,
    pub file_width: u16,
    pub file_height: u16,
    pub interval: u16,
}

impl TiledJpegFixture {
    /// Tile width of level 0.
    pub fn tile_width(&self) -> u32 {
        self.interval as u32 * 8
    }

    /// Restart units per MCU row of one file.
    pub fn units_per_row(&self) -> usize {
        self.file_width as usize / self.tile_width() as usize
    }

    /// Expected gray of a level-0 pixel.
    pub fn expected_shade(&self, x: u32, y: u32) -> u8 {
        let file = x as usize / self.file_width as usize;
        let local_x = x as usize % self.file_width as usize;
        let unit = (y as usize / 8) * self.units_per_row() + local_x / self.tile_width() as usize;
        tile_shade(file, unit)
    }
}

/// Write `columns` files side by side in one row plus a key file.
pub fn write_tiled_jpeg_slide(
    columns: usize,
    file_width: u16,
    file_height: u16,
    interval: u16,
    comment: Option<&str>,
) -> TiledJpegFixture {
    let dir = tempfile::tempdir().unwrap();
    let mut key = String::from("[Virtual Microscope Specimen]\n");
    key.push_str("SourceLens=20\n");
    key.push_str(&format!("NoJpegColumns={}\nNoJpegRows=1\n", columns));

    for col in 0..columns {
        let name = format!("slide_{}.jpg", col);
        let jpeg = restart_jpeg(file_width, file_height, interval, comment, |unit| {
            tile_shade(col, unit)
        });
        std::fs::write(dir.path().join(&name), jpeg).unwrap();
        key.push_str(&format!("ImageFile({},0)={}\n", col, name));
    }

    let key_file = dir.path().join("slide.vms");
    std::fs::write(&key_file, key).unwrap();

    TiledJpegFixture {
        dir,
        key_file,
        columns,
        file_width,
        file_height,
        interval,
    }
}

/// Append a line to the key file of a fixture.
pub fn append_key(key_file: &Path, line: &str) {
    let mut text = std::fs::read_to_string(key_file).unwrap();
    text.push_str(line);
    text.push('\n');
    std::fs::write(key_file, text).unwrap();
}

// =============================================================================
// DICOM Fixtures
// =============================================================================

pub const VOLUME: &str = "ORIGINAL\\PRIMARY\\VOLUME\\NONE";
pub const RESAMPLED: &str = "DERIVED\\PRIMARY\\VOLUME\\RESAMPLED";
pub const LABEL: &str = "ORIGINAL\\PRIMARY\\LABEL\\NONE";

const VL_WSI: &str = "1.2.840.10008.5.1.4.1.1.77.1.6";
const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

/// A flat gray JPEG frame of even length.
///
/// Encapsulated items must have even lengths; the COM segment absorbs the
/// difference.
pub fn flat_frame(width: u16, height: u16, shade: u8) -> Vec<u8> {
    let frame = restart_jpeg(width, height, width / 8, Some(""), |_| shade);
    if frame.len() % 2 == 0 {
        frame
    } else {
        restart_jpeg(width, height, width / 8, Some(" "), |_| shade)
    }
}

/// One instance of a DICOM whole slide series.
pub struct DicomInstance {
    pub image_type: &'static str,
    pub width: u32,
    pub height: u32,
    pub tile_width: u16,
    pub tile_height: u16,
    pub number_of_frames: u32,
    pub frames: Vec<Vec<u8>>,
}

impl DicomInstance {
    /// A level with square tiles where frame `i` is a flat tile of `shade(i)`.
    pub fn level(
        image_type: &'static str,
        width: u32,
        height: u32,
        tile: u16,
        shade: impl Fn(usize) -> u8,
    ) -> Self {
        let count = width.div_ceil(tile as u32) * height.div_ceil(tile as u32);
        Self {
            image_type,
            width,
            height,
            tile_width: tile,
            tile_height: tile,
            number_of_frames: count,
            frames: (0..count as usize)
                .map(|i| flat_frame(tile, tile, shade(i)))
                .collect(),
        }
    }

    /// A single-frame associated image.
    pub fn associated(image_type: &'static str, width: u16, height: u16, shade: u8) -> Self {
        Self {
            image_type,
            width: width as u32,
            height: height as u32,
            tile_width: width,
            tile_height: height,
            number_of_frames: 1,
            frames: vec![flat_frame(width, height, shade)],
        }
    }

    /// Write the instance as a JPEG baseline encapsulated file.
    pub fn write(&self, path: &Path, series_uid: &str, instance_uid: &str) {
        let pixel_data = PixelFragmentSequence::new(Vec::<u32>::new(), self.frames.clone());
        let object = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, VL_WSI),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, instance_uid),
            DataElement::new(tags::IMAGE_TYPE, VR::CS, self.image_type),
            DataElement::new(tags::MANUFACTURER, VR::LO, "ACME"),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.826.0.1.1"),
            DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, series_uid),
            DataElement::new(
                tags::NUMBER_OF_FRAMES,
                VR::IS,
                self.number_of_frames.to_string(),
            ),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(self.tile_height)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(self.tile_width)),
            DataElement::new(
                tags::TOTAL_PIXEL_MATRIX_COLUMNS,
                VR::UL,
                PrimitiveValue::from(self.width),
            ),
            DataElement::new(
                tags::TOTAL_PIXEL_MATRIX_ROWS,
                VR::UL,
                PrimitiveValue::from(self.height),
            ),
            DataElement::new(tags::PIXEL_DATA, VR::OB, DicomValue::from(pixel_data)),
        ]);

        object
            .with_meta(FileMetaTableBuilder::new().transfer_syntax(JPEG_BASELINE))
            .unwrap()
            .write_to_file(path)
            .unwrap();
    }
}

/// Series identity of the slide written by [`write_dicom_slide`].
pub const SERIES_UID: &str = "1.2.826.0.1.2";

/// Write a two-level series with a label, next to a level of another series
/// and a text file.
///
/// Level 0 is 64x48 with 32x32 tiles: frame `i` has gray [`dicom_shade`]`(i)`.
/// Level 1 is one 32x24 tile of gray 200. The label is 48x32 of gray 230.
pub fn write_dicom_slide() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    DicomInstance::level(RESAMPLED, 32, 24, 32, |_| 200).write(
        &dir.path().join("level1.dcm"),
        SERIES_UID,
        "1.2.826.0.1.2.2",
    );
    DicomInstance::level(VOLUME, 64, 48, 32, dicom_shade).write(
        &dir.path().join("level0.dcm"),
        SERIES_UID,
        "1.2.826.0.1.2.1",
    );
    DicomInstance::associated(LABEL, 48, 32, 230).write(
        &dir.path().join("label.dcm"),
        SERIES_UID,
        "1.2.826.0.1.2.3",
    );
    DicomInstance::level(VOLUME, 128, 96, 32, |_| 10).write(
        &dir.path().join("other.dcm"),
        "1.2.826.0.1.9",
        "1.2.826.0.1.9.1",
    );
    std::fs::write(dir.path().join("notes.txt"), b"scan notes").unwrap();
    dir
}

/// Gray of frame `i` of level 0 of [`write_dicom_slide`].
pub fn dicom_shade(frame: usize) -> u8 {
    40 + 50 * frame as u8
}

// =============================================================================
// Counting Decoder
// =============================================================================

/// Decoder that counts the decodes it performs.
#[derive(Debug, Default)]
pub struct CountingDecoder {
    inner: ImageJpegDecoder,
    decodes: AtomicUsize,
}

impl CountingDecoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl TileDecoder for CountingDecoder {
    fn decode(&self, data: &[u8], width: u32, height: u32) -> Result<Vec<u32>, DecodeError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(data, width, height)
    }

    fn decode_dimensions(&self, data: &[u8]) -> Result<(u32, u32), DecodeError> {
        self.inner.decode_dimensions(data)
    }
}
