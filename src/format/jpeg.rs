//! JPEG stream handling utilities.
//!
//! Tiled JPEG slides store each pyramid fragment as one large baseline JPEG
//! whose scan is divided by restart markers. Every restart interval spans a
//! horizontal strip of MCUs, so each interval can be decoded on its own once
//! its byte range is known.
//!
//! # Restart Units
//!
//! With `R` MCUs per restart interval and `M` MCUs per row, a row of MCUs
//! holds `M / R` restart units. The whole scan holds
//! `M / R * MCU_rows` units, numbered row-major. A unit decodes to a tile of
//! `width / (M / R)` by `height / MCU_rows` pixels.
//!
//! # Single-Tile Streams
//!
//! To decode one unit, the file header (everything up to the first entropy
//! coded byte) is concatenated with the unit's bytes:
//!
//! 1. The frame header is patched to the tile's width and height
//! 2. The restart interval is patched to zero
//! 3. The trailing restart marker is rewritten into EOI
//!
//! Result: SOI + tables + SOF(tile size) + SOS + unit scan data + EOI

use bytes::{Bytes, BytesMut};

use crate::error::FormatError;
use crate::io::{read_u16_be, RangeReader};

// =============================================================================
// JPEG Markers
// =============================================================================

/// Start Of Image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// End Of Image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Start Of Frame (baseline DCT) marker
pub const SOF0: [u8; 2] = [0xFF, 0xC0];

/// Start Of Frame (extended sequential DCT) marker
pub const SOF1: [u8; 2] = [0xFF, 0xC1];

/// Define Huffman Table marker
pub const DHT: [u8; 2] = [0xFF, 0xC4];

/// Define Quantization Table marker
pub const DQT: [u8; 2] = [0xFF, 0xDB];

/// Define Restart Interval marker
pub const DRI: [u8; 2] = [0xFF, 0xDD];

/// Start Of Scan marker
pub const SOS: [u8; 2] = [0xFF, 0xDA];

/// Comment marker
pub const COM: [u8; 2] = [0xFF, 0xFE];

/// First restart marker code (RST0)
pub const RST0: u8 = 0xD0;

/// Last restart marker code (RST7)
pub const RST7: u8 = 0xD7;

/// Bytes read from the start of a file when looking for the scan header.
const INITIAL_HEADER_READ: usize = 64 * 1024;

/// Check if a marker code is one of the eight restart markers.
#[inline]
pub fn is_restart_marker(code: u8) -> bool {
    (RST0..=RST7).contains(&code)
}

// =============================================================================
// JPEG Header
// =============================================================================

/// The parts of a baseline JPEG header needed for random access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JpegHeader {
    /// Image width in pixels
    pub width: u32,

    /// Image height in pixels
    pub height: u32,

    /// Number of color components in the frame
    pub components: u8,

    /// Largest horizontal sampling factor
    pub max_h_sampling: u8,

    /// Largest vertical sampling factor
    pub max_v_sampling: u8,

    /// MCUs per restart interval (0 = no restart markers)
    pub restart_interval: u32,

    /// Text of the first COM segment, up to its first NUL byte
    pub comment: Option<String>,

    /// Offset of the first entropy-coded byte (end of the SOS segment)
    pub scan_start: u64,

    /// Offset of the SOF segment payload
    sof_payload: usize,

    /// Offset of the DRI segment payload, if present
    dri_payload: Option<usize>,
}

/// Restart-unit layout of a JPEG scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartGeometry {
    /// Restart units per MCU row
    pub units_per_row: u32,

    /// Total restart units in the scan
    pub unit_count: u32,

    /// Pixel width decoded from one unit
    pub tile_width: u32,

    /// Pixel height decoded from one unit
    pub tile_height: u32,
}

impl JpegHeader {
    /// Parse a JPEG header from the start of a stream.
    ///
    /// Returns `Ok(None)` if `data` ends before the start of scan, so the
    /// caller can retry with a longer prefix.
    pub fn parse(data: &[u8]) -> Result<Option<Self>, FormatError> {
        if data.len() < 2 {
            return Ok(None);
        }
        if data[0..2] != SOI {
            return Err(FormatError::InvalidJpeg("missing SOI marker".to_string()));
        }

        let mut frame: Option<(u32, u32, u8, u8, u8, usize)> = None;
        let mut restart_interval = 0u32;
        let mut dri_payload = None;
        let mut comment = None;

        let mut pos = 2;
        loop {
            if pos >= data.len() {
                return Ok(None);
            }
            if data[pos] != 0xFF {
                return Err(FormatError::InvalidJpeg(format!(
                    "expected marker at offset {}, found 0x{:02X}",
                    pos, data[pos]
                )));
            }

            // Skip fill bytes
            while pos < data.len() && data[pos] == 0xFF {
                pos += 1;
            }
            if pos >= data.len() {
                return Ok(None);
            }
            let code = data[pos];
            pos += 1;

            // Standalone markers carry no length
            match code {
                0x01 | 0xD8 => continue,
                code if is_restart_marker(code) => continue,
                0xD9 => {
                    return Err(FormatError::InvalidJpeg(
                        "end of image before start of scan".to_string(),
                    ))
                }
                _ => {}
            }

            if pos + 2 > data.len() {
                return Ok(None);
            }
            let segment_len = read_u16_be(&data[pos..]) as usize;
            if segment_len < 2 {
                return Err(FormatError::InvalidJpeg(format!(
                    "segment 0x{:02X} has invalid length {}",
                    code, segment_len
                )));
            }
            if pos + segment_len > data.len() {
                return Ok(None);
            }
            let payload = &data[pos + 2..pos + segment_len];

            match code {
                0xC0 | 0xC1 => {
                    frame = Some(parse_frame(payload, pos + 2)?);
                }
                0xC2 | 0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                    return Err(FormatError::InvalidJpeg(format!(
                        "unsupported frame type 0x{:02X} (only baseline is supported)",
                        code
                    )));
                }
                0xDD => {
                    if payload.len() < 2 {
                        return Err(FormatError::InvalidJpeg("short DRI segment".to_string()));
                    }
                    restart_interval = read_u16_be(payload) as u32;
                    dri_payload = Some(pos + 2);
                }
                0xFE => {
                    if comment.is_none() {
                        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                        comment = Some(String::from_utf8_lossy(&payload[..end]).into_owned());
                    }
                }
                0xDA => {
                    let (width, height, components, max_h, max_v, sof_payload) = frame
                        .ok_or_else(|| {
                            FormatError::InvalidJpeg("start of scan before frame header".to_string())
                        })?;

                    return Ok(Some(JpegHeader {
                        width,
                        height,
                        components,
                        max_h_sampling: max_h,
                        max_v_sampling: max_v,
                        restart_interval,
                        comment,
                        scan_start: (pos + segment_len) as u64,
                        sof_payload,
                        dri_payload,
                    }));
                }
                _ => {}
            }

            pos += segment_len;
        }
    }

    /// Read and parse the header of a JPEG file.
    ///
    /// Returns the header along with the raw header bytes (everything before
    /// the first entropy-coded byte).
    pub fn read<R: RangeReader + ?Sized>(reader: &R) -> Result<(Self, Bytes), FormatError> {
        let size = reader.size();
        let mut len = (INITIAL_HEADER_READ as u64).min(size) as usize;

        loop {
            let bytes = reader.read_exact_at(0, len)?;
            if let Some(header) = Self::parse(&bytes)? {
                let header_bytes = bytes.slice(..header.scan_start as usize);
                return Ok((header, header_bytes));
            }

            if len as u64 >= size {
                return Err(FormatError::InvalidJpeg(format!(
                    "no start of scan found in {}",
                    reader.identifier()
                )));
            }
            len = (len as u64 * 4).min(size) as usize;
        }
    }

    /// MCU size in pixels.
    ///
    /// A single-component scan is non-interleaved, so its MCU is one 8x8
    /// block regardless of the declared sampling factors.
    pub fn mcu_size(&self) -> (u32, u32) {
        if self.components == 1 {
            (8, 8)
        } else {
            (
                8 * self.max_h_sampling as u32,
                8 * self.max_v_sampling as u32,
            )
        }
    }

    /// Number of MCUs in one row of the scan.
    pub fn mcus_per_row(&self) -> u32 {
        self.width.div_ceil(self.mcu_size().0)
    }

    /// Number of MCU rows in the scan.
    pub fn mcu_rows(&self) -> u32 {
        self.height.div_ceil(self.mcu_size().1)
    }

    /// Compute the restart-unit layout of the scan.
    pub fn restart_geometry(&self) -> Result<RestartGeometry, FormatError> {
        if self.restart_interval == 0 {
            return Err(FormatError::InvalidJpeg(
                "stream has no restart interval".to_string(),
            ));
        }

        let mcus_per_row = self.mcus_per_row();
        if mcus_per_row % self.restart_interval != 0 {
            return Err(FormatError::InvalidJpeg(format!(
                "restart interval {} does not divide {} MCUs per row",
                self.restart_interval, mcus_per_row
            )));
        }

        let units_per_row = mcus_per_row / self.restart_interval;
        let mcu_rows = self.mcu_rows();

        Ok(RestartGeometry {
            units_per_row,
            unit_count: units_per_row * mcu_rows,
            tile_width: self.width / units_per_row,
            tile_height: self.height / mcu_rows,
        })
    }
}

/// Parse a SOF0/SOF1 payload into (width, height, components, max_h, max_v, offset).
fn parse_frame(payload: &[u8], offset: usize) -> Result<(u32, u32, u8, u8, u8, usize), FormatError> {
    if payload.len() < 6 {
        return Err(FormatError::InvalidJpeg("short frame header".to_string()));
    }
    if payload[0] != 8 {
        return Err(FormatError::InvalidJpeg(format!(
            "unsupported sample precision {}",
            payload[0]
        )));
    }

    let height = read_u16_be(&payload[1..]) as u32;
    let width = read_u16_be(&payload[3..]) as u32;
    let components = payload[5];

    if width == 0 || height == 0 {
        return Err(FormatError::InvalidJpeg(format!(
            "invalid frame size {}x{}",
            width, height
        )));
    }
    if components == 0 || payload.len() < 6 + 3 * components as usize {
        return Err(FormatError::InvalidJpeg(
            "frame header component list is truncated".to_string(),
        ));
    }

    let mut max_h = 1;
    let mut max_v = 1;
    for i in 0..components as usize {
        let sampling = payload[6 + 3 * i + 1];
        max_h = max_h.max(sampling >> 4);
        max_v = max_v.max(sampling & 0x0F);
    }

    Ok((width, height, components, max_h, max_v, offset))
}

// =============================================================================
// Single-Tile Stream Synthesis
// =============================================================================

/// Build a self-contained JPEG stream for one restart unit.
///
/// # Arguments
/// * `header` - Parsed header of the source file
/// * `header_bytes` - Source bytes `[0, scan_start)`
/// * `unit_data` - Source bytes from the unit's start up to and including
///   the restart marker (or EOI) that ends it
/// * `tile_width`, `tile_height` - Size of the unit in pixels
pub fn build_tile_stream(
    header: &JpegHeader,
    header_bytes: &[u8],
    unit_data: &[u8],
    tile_width: u32,
    tile_height: u32,
) -> Result<Bytes, FormatError> {
    if header_bytes.len() as u64 != header.scan_start {
        return Err(FormatError::InvalidJpeg(format!(
            "header is {} bytes, expected {}",
            header_bytes.len(),
            header.scan_start
        )));
    }
    if unit_data.len() < 2 || unit_data[0] == 0xFF || unit_data[unit_data.len() - 2] != 0xFF {
        return Err(FormatError::InvalidJpeg(
            "restart unit is not delimited by markers".to_string(),
        ));
    }
    if tile_width > u16::MAX as u32 || tile_height > u16::MAX as u32 {
        return Err(FormatError::InvalidJpeg(format!(
            "tile size {}x{} does not fit a frame header",
            tile_width, tile_height
        )));
    }

    let mut stream = BytesMut::with_capacity(header_bytes.len() + unit_data.len());
    stream.extend_from_slice(header_bytes);

    let sof = header.sof_payload;
    stream[sof + 1..sof + 3].copy_from_slice(&(tile_height as u16).to_be_bytes());
    stream[sof + 3..sof + 5].copy_from_slice(&(tile_width as u16).to_be_bytes());

    // One unit holds exactly one interval, so no restart markers remain
    if let Some(dri) = header.dri_payload {
        stream[dri..dri + 2].copy_from_slice(&[0, 0]);
    }

    stream.extend_from_slice(unit_data);
    let last = stream.len() - 1;
    stream[last] = EOI[1];

    Ok(stream.freeze())
}

// =============================================================================
// Tests
// =============================================================================
