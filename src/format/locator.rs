//! Lazy restart-marker offset tables.
//!
//! Each JPEG source keeps one entry per restart unit. Entry 0 is the start of
//! the scan data and is known from the header. Other entries are discovered
//! by scanning forward from the nearest known predecessor, or taken from an
//! offset hint after a cheap validation read. Once written an entry never
//! changes.
//!
//! Callers serialize access to a table (the tiled JPEG slide holds one lock
//! over all of its tables), so nothing here is synchronized.

use tracing::{debug, warn};

use crate::error::IoError;
use crate::format::jpeg::is_restart_marker;
use crate::io::RangeReader;

/// Bytes fetched per read while scanning for markers.
const SCAN_BUFFER_SIZE: usize = 4096;

// =============================================================================
// Offset Table
// =============================================================================

/// Byte offsets of the restart units in one JPEG stream.
#[derive(Debug, Clone)]
pub struct OffsetTable {
    starts: Vec<Option<u64>>,
    hints: Option<Vec<u64>>,
    cursor: Option<ScanCursor>,
}

impl OffsetTable {
    /// Create a table with `unit_count` entries, only the first of which is known.
    pub fn new(unit_count: usize, scan_start: u64) -> Self {
        let mut starts = vec![None; unit_count.max(1)];
        starts[0] = Some(scan_start);
        Self {
            starts,
            hints: None,
            cursor: None,
        }
    }

    /// Attach offset hints (0 = unknown).
    ///
    /// Hints of the wrong length are discarded.
    pub fn with_hints(mut self, hints: Vec<u64>, identifier: &str) -> Self {
        if hints.len() == self.starts.len() {
            self.hints = Some(hints);
        } else {
            warn!(
                source = identifier,
                expected = self.starts.len(),
                actual = hints.len(),
                "Discarding offset hints with mismatched length"
            );
        }
        self
    }

    /// Number of restart units in the stream.
    pub fn len(&self) -> usize {
        self.starts.len()
    }

    /// Always false: every stream has at least one unit.
    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Offset of a unit, if it has been discovered.
    pub fn get(&self, index: usize) -> Option<u64> {
        self.starts.get(index).copied().flatten()
    }

    /// Number of units whose offsets are known.
    pub fn known_count(&self) -> usize {
        self.starts.iter().filter(|s| s.is_some()).count()
    }

    /// Whether every offset is known.
    pub fn is_complete(&self) -> bool {
        self.starts.iter().all(Option::is_some)
    }

    /// Export the table with 0 for unknown entries.
    pub fn export(&self) -> Vec<u64> {
        self.starts.iter().map(|s| s.unwrap_or(0)).collect()
    }

    fn hint(&self, index: usize) -> Option<u64> {
        self.hints
            .as_ref()
            .and_then(|h| h.get(index).copied())
            .filter(|&h| h != 0)
    }

    /// Nearest known entry at or before `index`.
    fn known_predecessor(&self, index: usize) -> (usize, u64) {
        (0..=index)
            .rev()
            .find_map(|i| self.starts[i].map(|offset| (i, offset)))
            .unwrap_or((0, 0))
    }
}

// =============================================================================
// Scan Cursor
// =============================================================================

/// Position and read-ahead buffer of a forward marker scan.
#[derive(Debug, Clone)]
pub struct ScanCursor {
    buf: Vec<u8>,
    buf_start: u64,
    pos: u64,
}

impl ScanCursor {
    /// Start a scan at `pos`.
    pub fn new(pos: u64) -> Self {
        Self {
            buf: Vec::new(),
            buf_start: pos,
            pos,
        }
    }

    /// Offset of the next byte the scan will look at.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Read the next byte, or `None` at end of file.
    fn next_byte<R: RangeReader + ?Sized>(&mut self, reader: &R) -> Result<Option<u8>, IoError> {
        let end = self.buf_start + self.buf.len() as u64;
        if self.pos >= end {
            let size = reader.size();
            if self.pos >= size {
                return Ok(None);
            }
            let len = (size - self.pos).min(SCAN_BUFFER_SIZE as u64) as usize;
            self.buf = reader.read_exact_at(self.pos, len)?.to_vec();
            self.buf_start = self.pos;
        }

        let byte = self.buf[(self.pos - self.buf_start) as usize];
        self.pos += 1;
        Ok(Some(byte))
    }

    /// Advance past the next restart marker.
    ///
    /// Returns the offset just after the marker, or `None` if EOI or the end
    /// of the file comes first.
    pub fn next_restart<R: RangeReader + ?Sized>(
        &mut self,
        reader: &R,
    ) -> Result<Option<u64>, IoError> {
        loop {
            match self.next_byte(reader)? {
                None => return Ok(None),
                Some(0xFF) => {}
                Some(_) => continue,
            }

            let code = loop {
                match self.next_byte(reader)? {
                    None => return Ok(None),
                    Some(0xFF) => continue,
                    Some(code) => break code,
                }
            };

            if is_restart_marker(code) {
                return Ok(Some(self.pos));
            }
            if code == 0xD9 {
                return Ok(None);
            }
        }
    }
}

// =============================================================================
// Offset Discovery
// =============================================================================

/// Make sure the offset of unit `target` is known.
///
/// Returns `Ok(None)` if the stream ends before the unit is reached. A second
/// call for a known unit does no I/O.
pub fn ensure_offset<R: RangeReader + ?Sized>(
    reader: &R,
    table: &mut OffsetTable,
    target: usize,
) -> Result<Option<u64>, IoError> {
    if target >= table.len() {
        return Ok(None);
    }
    if let Some(offset) = table.starts[target] {
        return Ok(Some(offset));
    }

    if let Some(hint) = table.hint(target) {
        if hint >= 2 && hint <= reader.size() {
            let marker = reader.read_exact_at(hint - 2, 2)?;
            if marker[0] == 0xFF && is_restart_marker(marker[1]) {
                table.starts[target] = Some(hint);
                return Ok(Some(hint));
            }
        }
        warn!(
            source = reader.identifier(),
            unit = target,
            offset = hint,
            "Offset hint does not point after a restart marker, scanning instead"
        );
    }

    let (mut index, start) = table.known_predecessor(target);
    let mut cursor = match table.cursor.take() {
        Some(cursor) if cursor.position() == start => cursor,
        _ => ScanCursor::new(start),
    };

    while index < target {
        match cursor.next_restart(reader)? {
            Some(offset) => {
                index += 1;
                // Entries are written once
                match table.starts[index] {
                    None => table.starts[index] = Some(offset),
                    Some(known) => debug_assert_eq!(known, offset, "unit {} moved", index),
                }
            }
            None => {
                debug!(
                    source = reader.identifier(),
                    unit = target,
                    last_found = index,
                    "Stream ended before restart unit"
                );
                return Ok(None);
            }
        }
    }

    table.cursor = Some(cursor);
    Ok(table.starts[target])
}

/// Byte range `[start, stop)` of a unit, including its closing marker.
///
/// The last unit runs to the end of the file.
pub fn unit_range<R: RangeReader + ?Sized>(
    reader: &R,
    table: &mut OffsetTable,
    unit: usize,
) -> Result<Option<(u64, u64)>, IoError> {
    let Some(start) = ensure_offset(reader, table, unit)? else {
        return Ok(None);
    };

    let stop = if unit + 1 < table.len() {
        match ensure_offset(reader, table, unit + 1)? {
            Some(stop) => stop,
            None => return Ok(None),
        }
    } else {
        reader.size()
    };

    Ok(Some((start, stop)))
}

/// Check that every known offset after the first is preceded by a restart
/// marker. Returns the indices of entries that are not.
pub fn verify_offsets<R: RangeReader + ?Sized>(
    reader: &R,
    table: &OffsetTable,
) -> Result<Vec<usize>, IoError> {
    let mut bad = Vec::new();

    for (index, start) in table.starts.iter().enumerate().skip(1) {
        let Some(offset) = *start else { continue };
        let valid = offset >= 2 && offset <= reader.size() && {
            let marker = reader.read_exact_at(offset - 2, 2)?;
            marker[0] == 0xFF && is_restart_marker(marker[1])
        };
        if !valid {
            bad.push(index);
        }
    }

    Ok(bad)
}
