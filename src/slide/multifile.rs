//! Multi-file slide assembly.
//!
//! Some formats store one slide as a directory of sibling files: one file
//! per pyramid level plus one per associated image, possibly next to files
//! from other slides. Given the path of any one member, the assembler:
//!
//! 1. Opens every file in the directory as a candidate member
//! 2. Requires the requested file to be among the valid members
//! 3. Keeps only members with the requested file's series identity
//! 4. Classifies members by their `ImageType` into levels and associated
//!    images, dropping the rest
//! 5. Orders levels from largest to smallest
//!
//! Member access goes through [`MemberOpener`] and [`TagReader`], so the
//! DICOM backend and tests can plug in their own members.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{FormatError, IoError};

/// `ImageType` values accepted for pyramid levels.
pub const LEVEL_IMAGE_TYPES: [[&str; 4]; 2] = [
    ["ORIGINAL", "PRIMARY", "VOLUME", "NONE"],
    ["DERIVED", "PRIMARY", "VOLUME", "RESAMPLED"],
];

/// `ImageType` values accepted for associated images.
pub const ASSOCIATED_IMAGE_TYPES: [[&str; 4]; 2] = [
    ["ORIGINAL", "PRIMARY", "LABEL", "NONE"],
    ["ORIGINAL", "PRIMARY", "OVERVIEW", "NONE"],
];

/// Attribute access on a member, by keyword.
pub trait TagReader {
    /// Integer value of an attribute.
    fn get_int(&self, keyword: &str) -> Option<i64>;

    /// Value `index` of a (possibly multi-valued) string attribute.
    fn get_string(&self, keyword: &str, index: usize) -> Option<String>;

    /// Floating point value of an attribute.
    fn get_float(&self, keyword: &str) -> Option<f64> {
        self.get_int(keyword).map(|v| v as f64)
    }
}

/// Opens and validates candidate members.
pub trait MemberOpener {
    type Member: TagReader;

    /// Open a file as a member. Files of the wrong kind return an error and
    /// are left out of the slide.
    fn open_member(&self, path: &Path) -> Result<Self::Member, FormatError>;
}

/// A member that holds one pyramid level.
#[derive(Debug)]
pub struct MemberLevel<M> {
    pub member: M,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tiles_across: u32,
    pub tiles_down: u32,
    pub frame_count: u32,

    /// Largest level width over this level's width
    pub downsample: f64,
}

impl<M> MemberLevel<M> {
    /// Frame holding tile (`col`, `row`), 0-based.
    pub fn frame_index(&self, col: u32, row: u32) -> Option<u32> {
        if col >= self.tiles_across || row >= self.tiles_down {
            return None;
        }
        let index = col + self.tiles_across * row;
        (index < self.frame_count).then_some(index)
    }
}

/// A member that holds an associated image.
#[derive(Debug)]
pub struct MemberAssociated<M> {
    pub member: M,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Result of assembling a multi-file slide.
#[derive(Debug)]
pub struct AssembledSlide<M> {
    /// Levels by increasing downsample
    pub levels: Vec<MemberLevel<M>>,

    /// Associated images by lower-cased `ImageType` value 3
    pub associated: BTreeMap<String, MemberAssociated<M>>,

    /// Series identity shared by every member
    pub series_uid: String,
}

/// Read the four `ImageType` values, upper-cased.
fn image_type<M: TagReader>(member: &M) -> Option<[String; 4]> {
    let value = |i| member.get_string("ImageType", i).map(|s| s.trim().to_uppercase());
    Some([value(0)?, value(1)?, value(2)?, value(3)?])
}

/// Index of the first accepted combination matching the member's `ImageType`.
fn matching_type(types: &[String; 4], accepted: &[[&str; 4]]) -> Option<usize> {
    accepted
        .iter()
        .position(|candidate| candidate.iter().zip(types).all(|(a, b)| *a == b.as_str()))
}

fn positive_int<M: TagReader>(member: &M, keyword: &str) -> Option<u32> {
    member
        .get_int(keyword)
        .filter(|&v| v > 0)
        .and_then(|v| u32::try_from(v).ok())
}

/// List regular files in a directory, sorted by name.
fn list_directory(dir: &Path) -> Result<Vec<PathBuf>, IoError> {
    let list_error = |e: std::io::Error| IoError::ListDir {
        path: dir.display().to_string(),
        message: e.to_string(),
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(list_error)? {
        let entry = entry.map_err(list_error)?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Assemble the slide that `path` belongs to.
pub fn assemble_members<O: MemberOpener>(
    opener: &O,
    path: &Path,
) -> Result<AssembledSlide<O::Member>, FormatError> {
    let requested_name = path
        .file_name()
        .ok_or_else(|| FormatError::RequestedFileRejected(path.display().to_string()))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut members = Vec::new();
    for candidate in list_directory(dir)? {
        match opener.open_member(&candidate) {
            Ok(member) => members.push((candidate, member)),
            Err(e) => debug!(path = %candidate.display(), error = %e, "Skipping non-member file"),
        }
    }

    let requested = members
        .iter()
        .find(|(p, _)| p.file_name() == Some(requested_name))
        .ok_or_else(|| FormatError::RequestedFileRejected(path.display().to_string()))?;
    let series_uid = requested
        .1
        .get_string("SeriesInstanceUID", 0)
        .ok_or_else(|| FormatError::MissingField("SeriesInstanceUID".to_string()))?;

    let mut levels = Vec::new();
    let mut associated = BTreeMap::new();

    for (member_path, member) in members {
        if member.get_string("SeriesInstanceUID", 0).as_deref() != Some(series_uid.as_str()) {
            debug!(path = %member_path.display(), "Skipping member of another series");
            continue;
        }

        let Some(types) = image_type(&member) else {
            debug!(path = %member_path.display(), "Skipping member without ImageType");
            continue;
        };

        if matching_type(&types, &LEVEL_IMAGE_TYPES).is_some() {
            match classify_level(member, member_path) {
                Ok(level) => levels.push(level),
                Err(reason) => debug!(reason = %reason, "Skipping level member"),
            }
        } else if matching_type(&types, &ASSOCIATED_IMAGE_TYPES).is_some() {
            let name = types[2].to_lowercase();
            let (Some(width), Some(height)) = (
                positive_int(&member, "TotalPixelMatrixColumns"),
                positive_int(&member, "TotalPixelMatrixRows"),
            ) else {
                debug!(path = %member_path.display(), "Skipping associated image without size");
                continue;
            };
            associated.entry(name).or_insert(MemberAssociated {
                member,
                path: member_path,
                width,
                height,
            });
        } else {
            debug!(path = %member_path.display(), image_type = ?types, "Skipping unclassified member");
        }
    }

    if levels.is_empty() {
        return Err(FormatError::NoTiles);
    }

    // Largest first: ascending downsample
    levels.sort_by(|a, b| b.width.cmp(&a.width));
    let largest = levels[0].width as f64;
    for level in &mut levels {
        level.downsample = largest / level.width as f64;
    }

    debug!(
        series_uid = %series_uid,
        levels = levels.len(),
        associated = associated.len(),
        "Assembled multi-file slide"
    );

    Ok(AssembledSlide {
        levels,
        associated,
        series_uid,
    })
}

fn classify_level<M: TagReader>(member: M, path: PathBuf) -> Result<MemberLevel<M>, String> {
    let field = |keyword: &str| {
        positive_int(&member, keyword)
            .ok_or_else(|| format!("{}: missing or invalid {}", path.display(), keyword))
    };

    let width = field("TotalPixelMatrixColumns")?;
    let height = field("TotalPixelMatrixRows")?;
    let tile_width = field("Columns")?;
    let tile_height = field("Rows")?;
    if tile_width != tile_height {
        return Err(format!(
            "{}: non-square {}x{} tiles",
            path.display(),
            tile_width,
            tile_height
        ));
    }
    let frame_count = positive_int(&member, "NumberOfFrames").unwrap_or(1);

    Ok(MemberLevel {
        member,
        path,
        width,
        height,
        tile_width,
        tile_height,
        tiles_across: width.div_ceil(tile_width),
        tiles_down: height.div_ceil(tile_height),
        frame_count,
        downsample: 1.0,
    })
}
