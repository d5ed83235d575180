//! DICOM whole slide backend.
//!
//! A DICOM slide is a directory of VL Whole Slide Microscopy files that share
//! a `SeriesInstanceUID`: one file per pyramid level plus optional label and
//! overview images. The directory is assembled by
//! [`crate::slide::multifile`]; this module supplies the DICOM members and
//! serves their frames as tiles.
//!
//! Member files are opened without their pixel data. Opening records where
//! the encapsulated pixel data starts; the fragment items of a level are
//! indexed on the first tile read from that level, and every frame is then
//! fetched with positioned reads.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, OpenFileOptions};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{FormatError, SlideError};
use crate::format::detect::has_dicom_magic;
use crate::io::{read_u16_le, read_u32_le, LocalFileReader, RangeReader};
use crate::slide::multifile::{
    assemble_members, MemberAssociated, MemberLevel, MemberOpener, TagReader,
};
use crate::slide::{SlideOptions, SlideReader};
use crate::tile::{GridGeometry, TileBuffer, TileCache, TileDecoder, TileSource};

/// SOP class of VL Whole Slide Microscopy Image Storage.
pub const VL_WSI_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.77.1.6";

/// Bytes needed for the preamble and magic check.
const MAGIC_LEN: usize = 132;

/// Size of an item header in an encapsulated pixel data sequence.
const ITEM_HEADER_LEN: u64 = 8;

const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;

const PIXEL_DATA: (u16, u16) = (0x7FE0, 0x0010);
const ITEM: (u16, u16) = (0xFFFE, 0xE000);
const ITEM_DELIMITER: (u16, u16) = (0xFFFE, 0xE00D);
const SEQUENCE_DELIMITER: (u16, u16) = (0xFFFE, 0xE0DD);

/// Explicit VRs with a reserved field and a 32-bit length.
const LONG_VRS: [[u8; 2]; 13] = [
    *b"OB", *b"OD", *b"OF", *b"OL", *b"OV", *b"OW", *b"SQ", *b"SV", *b"UC", *b"UN", *b"UR",
    *b"UT", *b"UV",
];

/// Transfer syntaxes whose data set is not explicit VR little endian:
/// implicit VR, big endian and deflated.
const UNWALKABLE_SYNTAXES: [&str; 3] = [
    "1.2.840.10008.1.2",
    "1.2.840.10008.1.2.2",
    "1.2.840.10008.1.2.1.99",
];

fn trim_value(value: &str) -> &str {
    value.trim_end_matches(['\0', ' ']).trim_start()
}

// =============================================================================
// Encapsulated Pixel Data Layout
// =============================================================================

/// Byte extent of one fragment's data in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub offset: u64,
    pub len: u32,
}

#[derive(Debug, Clone, Copy)]
struct ElementHeader {
    tag: (u16, u16),
    vr: [u8; 2],
    len: u32,
    value_offset: u64,
}

/// Read an explicit VR little endian element header, or an item header.
fn read_header<R: RangeReader + ?Sized>(reader: &R, pos: u64) -> Result<ElementHeader, FormatError> {
    let head = reader.read_exact_at(pos, 8)?;
    let tag = (read_u16_le(&head[0..2]), read_u16_le(&head[2..4]));
    if tag.0 == 0xFFFE {
        return Ok(ElementHeader {
            tag,
            vr: [0, 0],
            len: read_u32_le(&head[4..8]),
            value_offset: pos + 8,
        });
    }

    let vr = [head[4], head[5]];
    if LONG_VRS.contains(&vr) {
        let len = reader.read_exact_at(pos + 8, 4)?;
        Ok(ElementHeader {
            tag,
            vr,
            len: read_u32_le(&len),
            value_offset: pos + 12,
        })
    } else {
        Ok(ElementHeader {
            tag,
            vr,
            len: read_u16_le(&head[6..8]) as u32,
            value_offset: pos + 8,
        })
    }
}

fn unexpected_tag(tag: (u16, u16), pos: u64) -> FormatError {
    FormatError::Dicom(format!(
        "unexpected tag ({:04X},{:04X}) at offset {}",
        tag.0, tag.1, pos
    ))
}

/// Offset just past the value of `header`.
fn skip_value<R: RangeReader + ?Sized>(reader: &R, header: &ElementHeader) -> Result<u64, FormatError> {
    if header.len != UNDEFINED_LENGTH {
        return Ok(header.value_offset + header.len as u64);
    }
    if header.vr == *b"SQ" {
        return skip_sequence(reader, header.value_offset);
    }
    Err(FormatError::Dicom(format!(
        "cannot skip undefined length {} value of ({:04X},{:04X})",
        String::from_utf8_lossy(&header.vr),
        header.tag.0,
        header.tag.1
    )))
}

fn skip_sequence<R: RangeReader + ?Sized>(reader: &R, mut pos: u64) -> Result<u64, FormatError> {
    loop {
        let item = read_header(reader, pos)?;
        pos = match item.tag {
            SEQUENCE_DELIMITER => return Ok(item.value_offset),
            ITEM if item.len == UNDEFINED_LENGTH => skip_item(reader, item.value_offset)?,
            ITEM => item.value_offset + item.len as u64,
            tag => return Err(unexpected_tag(tag, pos)),
        };
    }
}

fn skip_item<R: RangeReader + ?Sized>(reader: &R, mut pos: u64) -> Result<u64, FormatError> {
    loop {
        let element = read_header(reader, pos)?;
        if element.tag == ITEM_DELIMITER {
            return Ok(element.value_offset);
        }
        pos = skip_value(reader, &element)?;
    }
}

/// Walk the top-level elements after the magic to the encapsulated pixel
/// data, returning the offset of its first item.
pub fn find_pixel_data<R: RangeReader + ?Sized>(reader: &R) -> Result<u64, FormatError> {
    let mut pos = MAGIC_LEN as u64;
    while pos + ITEM_HEADER_LEN <= reader.size() {
        let header = read_header(reader, pos)?;
        if header.tag == PIXEL_DATA {
            if header.len != UNDEFINED_LENGTH {
                return Err(FormatError::Dicom("pixel data is not encapsulated".to_string()));
            }
            return Ok(header.value_offset);
        }
        pos = skip_value(reader, &header)?;
    }
    Err(FormatError::MissingField("PixelData".to_string()))
}

/// Read the Basic Offset Table and the fragment extents of the encapsulated
/// pixel data whose first item is at `start`.
pub fn read_fragments<R: RangeReader + ?Sized>(
    reader: &R,
    start: u64,
) -> Result<(Vec<u32>, Vec<Fragment>), FormatError> {
    let table_item = read_header(reader, start)?;
    if table_item.tag != ITEM || table_item.len == UNDEFINED_LENGTH {
        return Err(FormatError::Dicom("missing Basic Offset Table item".to_string()));
    }
    let table = reader.read_exact_at(table_item.value_offset, table_item.len as usize)?;
    let offset_table = table.chunks_exact(4).map(read_u32_le).collect();

    let mut fragments = Vec::new();
    let mut pos = table_item.value_offset + table_item.len as u64;
    while pos + ITEM_HEADER_LEN <= reader.size() {
        let item = read_header(reader, pos)?;
        match item.tag {
            SEQUENCE_DELIMITER => break,
            ITEM if item.len != UNDEFINED_LENGTH => {
                fragments.push(Fragment {
                    offset: item.value_offset,
                    len: item.len,
                });
                pos = item.value_offset + item.len as u64;
            }
            tag => return Err(unexpected_tag(tag, pos)),
        }
    }
    Ok((offset_table, fragments))
}

/// Split encapsulated fragments into frames, as ranges of fragment indices.
///
/// Fragments map 1:1 to frames when the counts agree. A single frame takes
/// every fragment. Otherwise the Basic Offset Table gives each frame's first
/// item, as a byte offset from the first fragment's item header.
pub fn group_frames(
    fragments: &[Fragment],
    offset_table: &[u32],
    frame_count: usize,
) -> Result<Vec<Range<usize>>, FormatError> {
    let Some(first) = fragments.first() else {
        return Err(FormatError::Dicom("pixel data holds no fragments".to_string()));
    };
    if fragments.len() == frame_count {
        return Ok((0..frame_count).map(|i| i..i + 1).collect());
    }
    if frame_count == 1 {
        return Ok(vec![0..fragments.len()]);
    }
    if offset_table.len() != frame_count {
        return Err(FormatError::Dicom(format!(
            "cannot map {} fragments to {} frames without an offset table",
            fragments.len(),
            frame_count
        )));
    }

    let base = first.offset - ITEM_HEADER_LEN;
    let positions: Vec<u64> = fragments
        .iter()
        .map(|f| f.offset - ITEM_HEADER_LEN - base)
        .collect();

    let mut frames = Vec::with_capacity(frame_count);
    for (i, &start) in offset_table.iter().enumerate() {
        let end = offset_table.get(i + 1).map(|&o| o as u64).unwrap_or(u64::MAX);
        let start = start as u64;
        let first = positions.iter().position(|&p| p == start).ok_or_else(|| {
            FormatError::Dicom(format!("offset table entry {} does not start an item", start))
        })?;
        let count = positions[first..].iter().take_while(|&&p| p < end).count();
        frames.push(first..first + count);
    }
    Ok(frames)
}

#[derive(Debug)]
struct FrameTable {
    fragments: Vec<Fragment>,
    frames: Vec<Range<usize>>,
}

// =============================================================================
// Members
// =============================================================================

/// One file of a DICOM slide, opened without its pixel data.
pub struct DicomMember {
    path: PathBuf,
    object: DefaultDicomObject,
    reader: LocalFileReader,

    /// Offset of the first item of the encapsulated pixel data
    pixel_data: u64,

    decode_lock: Mutex<()>,
    frames: Mutex<Option<Arc<FrameTable>>>,
}

impl DicomMember {
    /// Fragment extents grouped into frames, indexed on first use.
    fn frame_table(&self, frame_count: u32) -> Result<Arc<FrameTable>, FormatError> {
        let mut slot = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = slot.as_ref() {
            return Ok(Arc::clone(table));
        }

        let (offset_table, fragments) = read_fragments(&self.reader, self.pixel_data)?;
        let frames = group_frames(&fragments, &offset_table, frame_count as usize)?;
        debug!(
            path = %self.path.display(),
            fragments = fragments.len(),
            frames = frames.len(),
            "Indexed DICOM frames"
        );

        let table = Arc::new(FrameTable { fragments, frames });
        *slot = Some(Arc::clone(&table));
        Ok(table)
    }

    /// Compressed bytes of frame `index`, read from the file.
    fn read_frame(&self, frame_count: u32, index: u32) -> Result<Bytes, FormatError> {
        let table = self.frame_table(frame_count)?;
        let range = table.frames.get(index as usize).cloned().ok_or_else(|| {
            FormatError::InvalidField {
                field: "NumberOfFrames".to_string(),
                message: format!(
                    "frame {} out of range, {} holds {} frames",
                    index,
                    self.path.display(),
                    table.frames.len()
                ),
            }
        })?;

        match &table.fragments[range] {
            [single] => Ok(self.reader.read_exact_at(single.offset, single.len as usize)?),
            parts => {
                let mut buf = BytesMut::with_capacity(parts.iter().map(|p| p.len as usize).sum());
                for part in parts {
                    buf.extend_from_slice(&self.reader.read_exact_at(part.offset, part.len as usize)?);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// SHA-256 over every tag and value of the metadata.
    fn quickhash(&self) -> String {
        let mut hasher = Sha256::new();
        for element in self.object.iter() {
            let tag = element.header().tag;
            let Ok(value) = element.to_str() else {
                continue;
            };
            hasher.update(format!("({:04X},{:04X})", tag.0, tag.1).as_bytes());
            hasher.update(trim_value(&value).as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl TagReader for DicomMember {
    fn get_int(&self, keyword: &str) -> Option<i64> {
        self.object.element_by_name(keyword).ok()?.to_int::<i64>().ok()
    }

    fn get_string(&self, keyword: &str, index: usize) -> Option<String> {
        let values = self.object.element_by_name(keyword).ok()?.to_multi_str().ok()?;
        values.get(index).map(|v| trim_value(v).to_string())
    }

    fn get_float(&self, keyword: &str) -> Option<f64> {
        self.object.element_by_name(keyword).ok()?.to_float64().ok()
    }
}

impl std::fmt::Debug for DicomMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DicomMember")
            .field("path", &self.path)
            .field("pixel_data", &self.pixel_data)
            .finish_non_exhaustive()
    }
}

/// Opens files that carry the DICOM magic and the whole slide SOP class.
#[derive(Debug, Default, Clone, Copy)]
pub struct DicomOpener;

impl MemberOpener for DicomOpener {
    type Member = DicomMember;

    fn open_member(&self, path: &Path) -> Result<DicomMember, FormatError> {
        let reader = LocalFileReader::open(path)?;
        if reader.size() < MAGIC_LEN as u64 || !has_dicom_magic(&reader.read_exact_at(0, MAGIC_LEN)?)
        {
            return Err(FormatError::UnsupportedFormat {
                reason: "missing DICM magic".to_string(),
            });
        }

        let object = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
            .map_err(|e| FormatError::Dicom(e.to_string()))?;

        let sop_class = trim_value(object.meta().media_storage_sop_class_uid()).to_string();
        if sop_class != VL_WSI_SOP_CLASS {
            return Err(FormatError::UnsupportedFormat {
                reason: format!("SOP class {} is not VL Whole Slide Microscopy", sop_class),
            });
        }

        let syntax = trim_value(object.meta().transfer_syntax());
        if UNWALKABLE_SYNTAXES.contains(&syntax) {
            return Err(FormatError::UnsupportedFormat {
                reason: format!("transfer syntax {} has no encapsulated pixel data", syntax),
            });
        }
        let pixel_data = find_pixel_data(&reader)?;

        Ok(DicomMember {
            path: path.to_path_buf(),
            object,
            reader,
            pixel_data,
            decode_lock: Mutex::new(()),
            frames: Mutex::new(None),
        })
    }
}

// =============================================================================
// DICOM Slide
// =============================================================================

/// A slide assembled from a directory of DICOM files.
pub struct DicomSlide {
    levels: Vec<MemberLevel<DicomMember>>,
    associated: BTreeMap<String, MemberAssociated<DicomMember>>,
    cache: TileCache,
    decoder: Arc<dyn TileDecoder>,
    properties: BTreeMap<String, String>,
}

impl DicomSlide {
    /// Open the slide that the file at `path` belongs to.
    pub fn open(path: &Path, options: &SlideOptions) -> Result<Self, SlideError> {
        let assembled = assemble_members(&DicomOpener, path)?;
        let levels = assembled.levels;

        let mut properties = BTreeMap::new();
        properties.insert(
            "dicom.SeriesInstanceUID".to_string(),
            assembled.series_uid.clone(),
        );

        let base = &levels[0];
        for keyword in ["StudyInstanceUID", "Manufacturer"] {
            if let Some(value) = base.member.get_string(keyword, 0).filter(|v| !v.is_empty()) {
                properties.insert(format!("dicom.{}", keyword), value);
            }
        }
        if let Some(mm) = base.member.get_float("ImagedVolumeWidth") {
            properties.insert("wsi.mpp-x".to_string(), (mm * 1000.0 / base.width as f64).to_string());
        }
        if let Some(mm) = base.member.get_float("ImagedVolumeHeight") {
            properties.insert("wsi.mpp-y".to_string(), (mm * 1000.0 / base.height as f64).to_string());
        }
        properties.insert("wsi.quickhash-1".to_string(), base.member.quickhash());

        for level in &levels {
            debug!(
                path = %level.path.display(),
                width = level.width,
                height = level.height,
                tile_width = level.tile_width,
                frames = level.frame_count,
                downsample = level.downsample,
                "DICOM level"
            );
        }
        info!(
            series_uid = %assembled.series_uid,
            levels = levels.len(),
            associated = assembled.associated.len(),
            width = base.width,
            height = base.height,
            "Opened DICOM slide"
        );

        Ok(Self {
            levels,
            associated: assembled.associated,
            cache: TileCache::with_capacity(options.cache_capacity),
            decoder: Arc::clone(&options.decoder),
            properties,
        })
    }

    fn level(&self, level: usize) -> Result<&MemberLevel<DicomMember>, SlideError> {
        self.levels.get(level).ok_or(SlideError::InvalidLevel {
            level,
            level_count: self.levels.len(),
        })
    }
}

impl TileSource for DicomSlide {
    fn level_count(&self) -> usize {
        self.levels.len()
    }

    fn grid(&self, level: usize) -> Option<GridGeometry> {
        let lvl = self.levels.get(level)?;
        Some(GridGeometry::covering(
            lvl.width,
            lvl.height,
            lvl.tile_width,
            lvl.tile_height,
        ))
    }

    fn cache(&self) -> &TileCache {
        &self.cache
    }

    fn decode_lock(&self, level: usize, _col: u32, _row: u32) -> Result<&Mutex<()>, SlideError> {
        Ok(&self.level(level)?.member.decode_lock)
    }

    fn decode_tile(&self, level: usize, col: u32, row: u32) -> Result<TileBuffer, SlideError> {
        let lvl = self.level(level)?;
        let frame = lvl
            .frame_index(col, row)
            .ok_or_else(|| FormatError::InvalidField {
                field: "NumberOfFrames".to_string(),
                message: format!(
                    "tile ({}, {}) of level {} maps past the {} frames of {}",
                    col,
                    row,
                    level,
                    lvl.frame_count,
                    lvl.path.display()
                ),
            })?;

        let data = lvl.member.read_frame(lvl.frame_count, frame)?;
        let pixels = self.decoder.decode(&data, lvl.tile_width, lvl.tile_height)?;
        Ok(TileBuffer::new(pixels, lvl.tile_width, lvl.tile_height))
    }
}

impl SlideReader for DicomSlide {
    fn level_downsample(&self, level: usize) -> Option<f64> {
        self.levels.get(level).map(|l| l.downsample)
    }

    fn to_level_coords(&self, level: usize, x: i64, y: i64) -> Option<(i64, i64)> {
        let d = self.levels.get(level)?.downsample;
        Some(((x as f64 / d) as i64, (y as f64 / d) as i64))
    }

    fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    fn associated_image_names(&self) -> Vec<String> {
        self.associated.keys().cloned().collect()
    }

    fn read_associated_image(&self, name: &str) -> Result<TileBuffer, SlideError> {
        let image = self
            .associated
            .get(name)
            .ok_or_else(|| SlideError::AssociatedImageNotFound(name.to_string()))?;

        let data = image.member.read_frame(1, 0)?;
        let pixels = self.decoder.decode(&data, image.width, image.height)?;
        Ok(TileBuffer::new(pixels, image.width, image.height))
    }
}
