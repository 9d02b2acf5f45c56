//! Two-tone halftone dithering.
//!
//! Converts an RGBA raster into a pixelated black/white (or any two colors) image:
//! integer luma reduction, Floyd–Steinberg error diffusion against a cutoff, then
//! nearest-neighbour block replication by `pixel_size`.
//!
//! The error buffer only spans the current row and is cleared before each row.
//! Carries into the row below bypass it and are added straight into the working
//! gray plane. This differs from the textbook two-row buffer and is kept as is:
//! changing it changes the output.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RGBA quadruplet, 8 bits per channel.
pub type Rgba = [u8; 4];

pub const OPAQUE_BLACK: Rgba = [0, 0, 0, 255];
pub const OPAQUE_WHITE: Rgba = [255, 255, 255, 255];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DitherError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("malformed input: {0}")]
    MalformedInput(String),
}

impl DitherError {
    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            DitherError::InvalidParameter(_) => "invalid_parameter",
            DitherError::MalformedInput(_) => "malformed_input",
        }
    }
}

/// Row-major RGBA8 raster, top row first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RasterImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, DitherError> {
        let img = Self {
            width,
            height,
            data,
        };
        img.validate()?;
        Ok(img)
    }

    /// Check that the buffer length matches the declared dimensions.
    pub fn validate(&self) -> Result<(), DitherError> {
        let expected = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| {
                DitherError::MalformedInput(format!(
                    "dimensions {}x{} overflow",
                    self.width, self.height
                ))
            })?;
        if self.data.len() != expected {
            return Err(DitherError::MalformedInput(format!(
                "pixel buffer holds {} bytes, {}x{} RGBA needs {}",
                self.data.len(),
                self.width,
                self.height,
                expected
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DitherParams {
    /// Edge length of the output block each source pixel expands into.
    pub pixel_size: i32,
    /// Luminance threshold as a fraction of 255.
    pub cutoff: f32,
    pub black_color: Rgba,
    pub white_color: Rgba,
}

impl Default for DitherParams {
    fn default() -> Self {
        Self {
            pixel_size: 1,
            cutoff: 0.5,
            black_color: OPAQUE_BLACK,
            white_color: OPAQUE_WHITE,
        }
    }
}

impl DitherParams {
    pub fn validate(&self) -> Result<(), DitherError> {
        if self.pixel_size <= 0 {
            return Err(DitherError::InvalidParameter(format!(
                "pixel_size must be a positive integer, got {}",
                self.pixel_size
            )));
        }
        if self.cutoff.is_nan() {
            return Err(DitherError::InvalidParameter(
                "cutoff must be a number".to_string(),
            ));
        }
        Ok(())
    }

    fn threshold(&self) -> Threshold {
        if self.cutoff <= 0.0 {
            Threshold::AllWhite
        } else if self.cutoff >= 1.0 {
            Threshold::AllBlack
        } else {
            Threshold::Level(self.cutoff * 255.0)
        }
    }
}

#[derive(Clone, Copy)]
enum Threshold {
    AllWhite,
    AllBlack,
    Level(f32),
}

/// Integer luma with weights 77/151/28 over 256.
#[inline(always)]
pub fn grayscale(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 77 + g as u32 * 151 + b as u32 * 28) >> 8) as u8
}

/// Dither `image` into a new raster of `width*pixel_size` x `height*pixel_size`.
///
/// The input is left untouched. Every output pixel is exactly `black_color` or
/// `white_color`.
pub fn dither(image: &RasterImage, params: &DitherParams) -> Result<RasterImage, DitherError> {
    params.validate()?;
    image.validate()?;
    let scale = params.pixel_size as u32;
    let out_w = image.width.checked_mul(scale);
    let out_h = image.height.checked_mul(scale);
    let (Some(out_w), Some(out_h)) = (out_w, out_h) else {
        return Err(DitherError::InvalidParameter(format!(
            "pixel_size {} overflows output dimensions for {}x{}",
            params.pixel_size, image.width, image.height
        )));
    };
    (out_w as usize)
        .checked_mul(out_h as usize)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| {
            DitherError::InvalidParameter(format!("output {out_w}x{out_h} is too large"))
        })?;

    let levels = threshold_pass(image, params.threshold());
    Ok(replicate_blocks(
        &levels,
        image.width as usize,
        image.height as usize,
        scale as usize,
        params.black_color,
        params.white_color,
    ))
}

/// Quantize every source pixel to `false` (black) or `true` (white).
fn threshold_pass(image: &RasterImage, threshold: Threshold) -> Vec<bool> {
    let width = image.width as usize;
    let height = image.height as usize;
    let cut = match threshold {
        Threshold::AllWhite => return vec![true; width * height],
        Threshold::AllBlack => return vec![false; width * height],
        Threshold::Level(cut) => cut,
    };

    let mut gray: Vec<u8> = image
        .data
        .chunks_exact(4)
        .map(|px| grayscale(px[0], px[1], px[2]))
        .collect();
    let mut levels = Vec::with_capacity(width * height);
    let mut errors = vec![0i32; width + 2];

    for y in 0..height {
        errors.fill(0);
        let row = y * width;
        for x in 0..width {
            let old = gray[row + x] as i32 + errors[x + 1];
            let new = if old as f32 <= cut { 0 } else { 255 };
            let err = old - new;
            errors[x + 2] += (err * 7) >> 4;
            if y + 1 < height {
                let below = row + width + x;
                if x > 0 {
                    carry(&mut gray[below - 1], (err * 3) >> 4);
                }
                carry(&mut gray[below], (err * 5) >> 4);
                if x + 1 < width {
                    carry(&mut gray[below + 1], err >> 4);
                }
            }
            levels.push(new != 0);
        }
    }
    levels
}

#[inline(always)]
fn carry(slot: &mut u8, amount: i32) {
    *slot = (*slot as i32 + amount).clamp(0, 255) as u8;
}

fn replicate_blocks(
    levels: &[bool],
    width: usize,
    height: usize,
    scale: usize,
    black: Rgba,
    white: Rgba,
) -> RasterImage {
    let out_w = width * scale;
    let out_h = height * scale;
    let mut data = Vec::with_capacity(out_w * out_h * 4);
    let mut line = Vec::with_capacity(out_w * 4);
    for y in 0..height {
        line.clear();
        for &is_white in &levels[y * width..(y + 1) * width] {
            let color = if is_white { white } else { black };
            for _ in 0..scale {
                line.extend_from_slice(&color);
            }
        }
        for _ in 0..scale {
            data.extend_from_slice(&line);
        }
    }
    RasterImage {
        width: out_w as u32,
        height: out_h as u32,
        data,
    }
}
