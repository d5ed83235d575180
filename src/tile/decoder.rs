//! JPEG tile decoding.
//!
//! Decoders turn a self-contained JPEG stream into packed ARGB pixels. The
//! default implementation uses the `image` crate; tests inject their own to
//! count or fake decodes.
//!
//! Pixels are `u32` values packed as `a << 24 | r << 16 | g << 8 | b`. JPEG
//! has no alpha channel, so every decoded pixel is opaque.

use std::io::Cursor;

use image::{imageops, ImageFormat, ImageReader, RgbaImage};

use crate::error::DecodeError;

/// Scale denominators supported by [`TileDecoder::decode_scaled`].
pub const SCALE_DENOMINATORS: [u32; 4] = [1, 2, 4, 8];

/// Pack opaque RGB components into an ARGB pixel.
#[inline]
pub fn pack_argb(r: u8, g: u8, b: u8) -> u32 {
    0xFF00_0000 | (r as u32) << 16 | (g as u32) << 8 | b as u32
}

/// Trait for JPEG decoders.
pub trait TileDecoder: Send + Sync {
    /// Decode a JPEG stream whose frame is exactly `width` x `height`.
    fn decode(&self, data: &[u8], width: u32, height: u32) -> Result<Vec<u32>, DecodeError>;

    /// Read the frame size of a JPEG stream without decoding it.
    fn decode_dimensions(&self, data: &[u8]) -> Result<(u32, u32), DecodeError>;

    /// Decode and reduce by `scale_denom`.
    ///
    /// Returns the pixels and their size, which is the full size divided by
    /// `scale_denom`, rounded up.
    fn decode_scaled(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
        scale_denom: u32,
    ) -> Result<(Vec<u32>, u32, u32), DecodeError> {
        let pixels = self.decode(data, width, height)?;
        Ok(downscale(pixels, width, height, scale_denom))
    }
}

/// Reduce an ARGB buffer by an integer factor.
pub fn downscale(pixels: Vec<u32>, width: u32, height: u32, scale_denom: u32) -> (Vec<u32>, u32, u32) {
    if scale_denom <= 1 {
        return (pixels, width, height);
    }

    let out_w = width.div_ceil(scale_denom).max(1);
    let out_h = height.div_ceil(scale_denom).max(1);

    let mut rgba = RgbaImage::new(width, height);
    for (dst, &argb) in rgba.pixels_mut().zip(pixels.iter()) {
        let [a, r, g, b] = argb.to_be_bytes();
        dst.0 = [r, g, b, a];
    }

    let small = imageops::thumbnail(&rgba, out_w, out_h);
    let out = small
        .pixels()
        .map(|p| {
            let [r, g, b, a] = p.0;
            u32::from_be_bytes([a, r, g, b])
        })
        .collect();

    (out, out_w, out_h)
}

// =============================================================================
// image-crate Decoder
// =============================================================================

/// Baseline JPEG decoder backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageJpegDecoder;

impl ImageJpegDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl TileDecoder for ImageJpegDecoder {
    fn decode(&self, data: &[u8], width: u32, height: u32) -> Result<Vec<u32>, DecodeError> {
        let img = ImageReader::with_format(Cursor::new(data), ImageFormat::Jpeg)
            .decode()
            .map_err(|e| DecodeError::Jpeg {
                message: e.to_string(),
            })?;

        if img.width() != width || img.height() != height {
            return Err(DecodeError::DimensionMismatch {
                expected_width: width,
                expected_height: height,
                actual_width: img.width(),
                actual_height: img.height(),
            });
        }

        let rgb = img.to_rgb8();
        Ok(rgb.pixels().map(|p| pack_argb(p[0], p[1], p[2])).collect())
    }

    fn decode_dimensions(&self, data: &[u8]) -> Result<(u32, u32), DecodeError> {
        ImageReader::with_format(Cursor::new(data), ImageFormat::Jpeg)
            .into_dimensions()
            .map_err(|e| DecodeError::Jpeg {
                message: e.to_string(),
            })
    }
}
