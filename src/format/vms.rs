//! VMS key file parsing.
//!
//! A key file is an INI-like text file that places each JPEG fragment of a
//! tiled JPEG slide on the pyramid grid:
//!
//! ```text
//! [Virtual Microscope Specimen]
//! NoJpegColumns=2
//! NoJpegRows=1
//! ImageFile=slide_00.jpg
//! ImageFile(1,0)=slide_01.jpg
//! ImageFile(0,0,1)=slide_lo.jpg
//! OptimisationFile=slide.hints
//! ```
//!
//! `ImageFile(x,y,z)` names the fragment at column `x`, row `y` of pyramid
//! level `z`. Bare `ImageFile` is `ImageFile(0,0)`, and the two-argument form
//! places the fragment on level 0. Paths are relative to the key file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{FormatError, IoError};

/// Section holding the slide keys.
pub const KEY_FILE_SECTION: &str = "Virtual Microscope Specimen";

/// One JPEG file and its grid position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JpegFragment {
    pub path: PathBuf,
    pub level: i64,
    pub col: i64,
    pub row: i64,
}

/// Parsed contents of a key file.
#[derive(Debug, Clone, Default)]
pub struct KeyFile {
    /// Fragments sorted by (level, row, column)
    pub fragments: Vec<JpegFragment>,

    /// Offset hint file, if one is named
    pub hint_file: Option<PathBuf>,

    /// Every key of the slide section, verbatim
    pub properties: BTreeMap<String, String>,
}

impl KeyFile {
    /// Parse key file text. Relative paths are resolved against `base_dir`.
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self, FormatError> {
        let mut key_file = KeyFile::default();
        let mut in_section = false;
        let mut seen_section = false;
        let mut columns = None;
        let mut rows = None;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| FormatError::KeyFile {
                    line: line_no,
                    message: "unterminated section header".to_string(),
                })?;
                in_section = name.trim() == KEY_FILE_SECTION;
                seen_section |= in_section;
                continue;
            }

            if !in_section {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(FormatError::KeyFile {
                    line: line_no,
                    message: format!("expected key=value, found {:?}", line),
                });
            };
            let key = key.trim();
            let value = value.trim();
            key_file.properties.insert(key.to_string(), value.to_string());

            if let Some(args) = key.strip_prefix("ImageFile") {
                let (col, row, level) = parse_position(args).ok_or_else(|| FormatError::KeyFile {
                    line: line_no,
                    message: format!("invalid image position {:?}", key),
                })?;

                if key_file
                    .fragments
                    .iter()
                    .any(|f| (f.level, f.col, f.row) == (level, col, row))
                {
                    return Err(FormatError::KeyFile {
                        line: line_no,
                        message: format!("duplicate image at ({}, {}, {})", col, row, level),
                    });
                }

                key_file.fragments.push(JpegFragment {
                    path: base_dir.join(value),
                    level,
                    col,
                    row,
                });
                continue;
            }

            match key {
                "NoJpegColumns" => columns = Some(parse_count(value, line_no)?),
                "NoJpegRows" => rows = Some(parse_count(value, line_no)?),
                "OptimisationFile" if !value.is_empty() => {
                    key_file.hint_file = Some(base_dir.join(value));
                }
                _ => {}
            }
        }

        if !seen_section {
            return Err(FormatError::KeyFile {
                line: 0,
                message: format!("missing [{}] section", KEY_FILE_SECTION),
            });
        }
        if key_file.fragments.is_empty() {
            return Err(FormatError::MissingField("ImageFile".to_string()));
        }

        key_file
            .fragments
            .sort_by_key(|f| (f.level, f.row, f.col));

        let base = key_file.fragments.iter().filter(|f| f.level == 0);
        if let Some(columns) = columns {
            if let Some(f) = base.clone().find(|f| f.col >= columns) {
                return Err(FormatError::InvalidField {
                    field: "NoJpegColumns".to_string(),
                    message: format!("image at column {} exceeds {} columns", f.col, columns),
                });
            }
        }
        if let Some(rows) = rows {
            if let Some(f) = base.clone().find(|f| f.row >= rows) {
                return Err(FormatError::InvalidField {
                    field: "NoJpegRows".to_string(),
                    message: format!("image at row {} exceeds {} rows", f.row, rows),
                });
            }
        }

        Ok(key_file)
    }

    /// Read and parse a key file from disk.
    pub fn read(path: &Path) -> Result<Self, FormatError> {
        let text = std::fs::read_to_string(path).map_err(|e| IoError::Open {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        Self::parse(&text, base_dir)
    }
}

/// Parse the `""`, `(x,y)` or `(x,y,z)` suffix of an `ImageFile` key.
fn parse_position(args: &str) -> Option<(i64, i64, i64)> {
    let args = args.trim();
    if args.is_empty() {
        return Some((0, 0, 0));
    }

    let inner = args.strip_prefix('(')?.strip_suffix(')')?;
    let values: Vec<i64> = inner
        .split(',')
        .map(|v| v.trim().parse::<i64>().ok().filter(|&v| v >= 0))
        .collect::<Option<_>>()?;

    match values.as_slice() {
        [x, y] => Some((*x, *y, 0)),
        [x, y, z] => Some((*x, *y, *z)),
        _ => None,
    }
}

fn parse_count(value: &str, line: usize) -> Result<i64, FormatError> {
    value
        .parse::<i64>()
        .ok()
        .filter(|&v| v > 0)
        .ok_or_else(|| FormatError::KeyFile {
            line,
            message: format!("invalid count {:?}", value),
        })
}
