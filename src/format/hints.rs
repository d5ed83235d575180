//! Offset hint files.
//!
//! A hint file stores the restart offset tables of a tiled JPEG slide so a
//! later session can skip the marker scan:
//!
//! ```text
//! "WSIHINT1"            8 bytes magic
//! source_count          u32 LE
//! repeated source_count times:
//!     entry_count       u32 LE
//!     offsets           entry_count x u64 LE (0 = unknown)
//! ```

use std::path::Path;

use bytes::{BufMut, BytesMut};

use crate::error::{FormatError, IoError};
use crate::io::{read_u32_le, read_u64_le};

/// Magic bytes at the start of every hint file.
pub const HINT_MAGIC: &[u8; 8] = b"WSIHINT1";

/// Decode a hint file.
pub fn parse_hints(data: &[u8]) -> Result<Vec<Vec<u64>>, FormatError> {
    if data.len() < 12 || &data[..8] != HINT_MAGIC {
        return Err(FormatError::HintFile("missing WSIHINT1 magic".to_string()));
    }

    let source_count = read_u32_le(&data[8..]) as usize;
    let mut pos = 12;
    let mut tables = Vec::with_capacity(source_count.min(4096));

    for source in 0..source_count {
        if pos + 4 > data.len() {
            return Err(FormatError::HintFile(format!(
                "truncated entry count for source {}",
                source
            )));
        }
        let count = read_u32_le(&data[pos..]) as usize;
        pos += 4;

        let end = count
            .checked_mul(8)
            .and_then(|len| pos.checked_add(len))
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                FormatError::HintFile(format!("truncated offsets for source {}", source))
            })?;

        tables.push(data[pos..end].chunks_exact(8).map(read_u64_le).collect());
        pos = end;
    }

    if pos != data.len() {
        return Err(FormatError::HintFile(format!(
            "{} trailing bytes",
            data.len() - pos
        )));
    }

    Ok(tables)
}

/// Encode offset tables into the hint file format.
pub fn encode_hints(tables: &[Vec<u64>]) -> BytesMut {
    let total: usize = tables.iter().map(|t| 4 + 8 * t.len()).sum();
    let mut buf = BytesMut::with_capacity(12 + total);

    buf.put_slice(HINT_MAGIC);
    buf.put_u32_le(tables.len() as u32);
    for table in tables {
        buf.put_u32_le(table.len() as u32);
        for &offset in table {
            buf.put_u64_le(offset);
        }
    }

    buf
}

/// Read a hint file from disk.
pub fn load_hints(path: &Path) -> Result<Vec<Vec<u64>>, FormatError> {
    let data = std::fs::read(path).map_err(|e| IoError::Open {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    parse_hints(&data)
}

/// Write a hint file to disk.
pub fn save_hints(path: &Path, tables: &[Vec<u64>]) -> Result<(), IoError> {
    std::fs::write(path, encode_hints(tables)).map_err(|e| IoError::Write {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
