//! Raw scan bytes to finished images.
//!
//! The pipeline hands over one contiguous buffer per page: a single frame for
//! gray and RGB acquisitions, or the three channels of a three-pass scan
//! already interleaved with [`interleaved_offset`]. Partial buffers are
//! padded with [`pad_partial`] before they get here.

use image::{DynamicImage, ImageBuffer, Luma, Rgb};

use crate::error::{Result, SaneError};
use crate::models::ScanParameters;

/// Filler for the part of a partial scan that hasn't been read yet.
pub const PARTIAL_FILLER: u8 = 0xFF;

/// Bit order of 1-bit colour data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitLayout {
    /// One RGB frame: `r0 g0 b0 r1 g1 b1 ...`, most significant bit first.
    Sequential,
    /// Interleaved three-pass frames: byte triples `R G B`, each byte
    /// covering eight pixels of its channel.
    ByteTriples,
}

/// Offset of byte `index` of `channel` inside a buffer interleaving three
/// single-channel frames of the given bit depth.
///
/// 8-bit and 1-bit frames interleave byte by byte: byte `i` of channel `c`
/// lands at `3 * i + c`. 16-bit frames keep each two-byte sample together,
/// so sample `i` of channel `c` starts at `6 * i + 2 * c`.
pub fn interleaved_offset(index: usize, channel: usize, depth: u32) -> usize {
    let sample_bytes = if depth == 16 { 2 } else { 1 };
    let sample = index / sample_bytes;
    let within = index % sample_bytes;
    sample * 3 * sample_bytes + channel * sample_bytes + within
}

/// Copy `data` into `expected` bytes, filling the rest with [`PARTIAL_FILLER`].
pub fn pad_partial(data: &[u8], expected: usize) -> Vec<u8> {
    let mut padded = Vec::with_capacity(expected);
    padded.extend_from_slice(&data[..data.len().min(expected)]);
    padded.resize(expected, PARTIAL_FILLER);
    padded
}

/// Expand one row of 1-bit colour data to one byte per sample (0 or 255),
/// in R, G, B order.
pub fn unpack_1bit_rgb(row: &[u8], width: usize, layout: BitLayout) -> Vec<u8> {
    let bit = |byte: usize, shift: usize| -> u8 {
        match row.get(byte) {
            Some(b) if b & (0x80 >> shift) != 0 => 255,
            _ => 0,
        }
    };
    let mut out = Vec::with_capacity(width * 3);
    for pixel in 0..width {
        for channel in 0..3 {
            let value = match layout {
                BitLayout::Sequential => {
                    let n = pixel * 3 + channel;
                    bit(n / 8, n % 8)
                }
                BitLayout::ByteTriples => bit((pixel / 8) * 3 + channel, pixel % 8),
            };
            out.push(value);
        }
    }
    out
}

fn unpack_1bit_gray(row: &[u8], width: usize) -> Vec<u8> {
    (0..width)
        .map(|x| match row.get(x / 8) {
            Some(b) if b & (0x80 >> (x % 8)) != 0 => 255,
            _ => 0,
        })
        .collect()
}

fn native_u16(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
        .collect()
}

/// Decode a complete page buffer.
///
/// # Errors
///
/// - [`SaneError::UnsupportedChannelLayout`] for frame kinds other than
///   gray, RGB or a red/green/blue pass
/// - [`SaneError::NoImageData`] when the geometry or buffer is empty
/// - [`SaneError::CannotGenerateImage`] for short buffers and bit depths
///   other than 1, 8 and 16
pub fn image_from_buffer(params: &ScanParameters, data: &[u8]) -> Result<DynamicImage> {
    let channels = params
        .frame_kind
        .channel_count()
        .ok_or(SaneError::UnsupportedChannelLayout)?;
    if params.width == 0 || params.height == 0 || data.is_empty() {
        return Err(SaneError::NoImageData);
    }

    let three_pass = params.frame_kind.is_single_channel_of_rgb();
    let stride = params.bytes_per_line * if three_pass { 3 } else { 1 };
    if data.len() < stride * params.height {
        return Err(SaneError::CannotGenerateImage);
    }

    let (width, height) = (params.width, params.height);
    let rows = data.chunks_exact(stride).take(height);
    let row_samples = width * channels;

    let image = match (params.depth, channels) {
        (1, 1) => {
            let pixels: Vec<u8> = rows.flat_map(|row| unpack_1bit_gray(row, width)).collect();
            ImageBuffer::<Luma<u8>, _>::from_raw(width as u32, height as u32, pixels)
                .map(DynamicImage::ImageLuma8)
        }
        (1, _) => {
            let layout = if three_pass {
                BitLayout::ByteTriples
            } else {
                BitLayout::Sequential
            };
            let pixels: Vec<u8> = rows
                .flat_map(|row| unpack_1bit_rgb(row, width, layout))
                .collect();
            ImageBuffer::<Rgb<u8>, _>::from_raw(width as u32, height as u32, pixels)
                .map(DynamicImage::ImageRgb8)
        }
        (8, _) => {
            if stride < row_samples {
                return Err(SaneError::CannotGenerateImage);
            }
            let pixels: Vec<u8> = rows
                .flat_map(|row| row[..row_samples].iter().copied())
                .collect();
            if channels == 1 {
                ImageBuffer::<Luma<u8>, _>::from_raw(width as u32, height as u32, pixels)
                    .map(DynamicImage::ImageLuma8)
            } else {
                ImageBuffer::<Rgb<u8>, _>::from_raw(width as u32, height as u32, pixels)
                    .map(DynamicImage::ImageRgb8)
            }
        }
        (16, _) => {
            if stride < row_samples * 2 {
                return Err(SaneError::CannotGenerateImage);
            }
            let samples: Vec<u16> = rows
                .flat_map(|row| native_u16(&row[..row_samples * 2]))
                .collect();
            if channels == 1 {
                ImageBuffer::<Luma<u16>, _>::from_raw(width as u32, height as u32, samples)
                    .map(DynamicImage::ImageLuma16)
            } else {
                ImageBuffer::<Rgb<u16>, _>::from_raw(width as u32, height as u32, samples)
                    .map(DynamicImage::ImageRgb16)
            }
        }
        _ => None,
    };
    image.ok_or(SaneError::CannotGenerateImage)
}
