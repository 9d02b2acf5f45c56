//! Bridges ordinary image files and the engine's raw rasters.

use std::io::Cursor;

use anyhow::{Context, Result, bail};
use image::{DynamicImage, GenericImageView, RgbaImage};

use crate::config::ImageLimits;
use crate::dither::RasterImage;

/// Decode PNG/JPEG bytes into an upright RGBA raster that fits within `limits`.
pub fn decode_upload(bytes: &[u8], limits: Option<&ImageLimits>) -> Result<RasterImage> {
    let mut img = image::load_from_memory(bytes).context("decoding uploaded image")?;
    if let Some(tag) = extract_exif_orientation(bytes) {
        img = apply_exif_orientation(img, tag);
    }
    let img = downscale_to_limits(img, limits);
    let (width, height) = img.dimensions();
    tracing::debug!(width, height, "decoded upload");
    Ok(RasterImage::new(width, height, img.to_rgba8().into_raw())?)
}

/// Encode a raster as PNG.
pub fn encode_png(raster: &RasterImage) -> Result<Vec<u8>> {
    let buf = RgbaImage::from_raw(raster.width, raster.height, raster.data.clone())
        .ok_or_else(|| anyhow::anyhow!("invalid pixel buffer size"))?;
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(buf)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| anyhow::anyhow!("png encode failed: {e}"))?;
    Ok(bytes)
}

/// Refuse jobs whose replicated output would exceed `max_output_pixels`.
pub fn check_output_budget(
    raster: &RasterImage,
    pixel_size: i32,
    limits: Option<&ImageLimits>,
) -> Result<()> {
    let Some(max) = limits.and_then(|l| l.max_output_pixels) else {
        return Ok(());
    };
    let scale = pixel_size.max(0) as u64;
    let out = (raster.width as u64)
        .checked_mul(scale)
        .zip((raster.height as u64).checked_mul(scale))
        .and_then(|(w, h)| w.checked_mul(h));
    match out {
        Some(out) if out <= max => Ok(()),
        Some(out) => bail!(
            "output of {}x{} at pixel size {} is {} pixels, limit is {}",
            raster.width,
            raster.height,
            pixel_size,
            out,
            max
        ),
        None => bail!(
            "output of {}x{} at pixel size {} overflows, limit is {}",
            raster.width,
            raster.height,
            pixel_size,
            max
        ),
    }
}

/// Attempt to parse EXIF orientation (1,3,6,8) from raw image bytes.
fn extract_exif_orientation(bytes: &[u8]) -> Option<u16> {
    let mut cursor = Cursor::new(bytes);
    let reader = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    let field = reader.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    field.value.get_uint(0).map(|v| v as u16)
}

/// Rotate into view orientation. Mirrored tags (2,4,5,7) are left as is.
fn apply_exif_orientation(img: DynamicImage, tag: u16) -> DynamicImage {
    match tag {
        3 => DynamicImage::ImageRgba8(image::imageops::rotate180(&img)),
        6 => DynamicImage::ImageRgba8(image::imageops::rotate90(&img)),
        8 => DynamicImage::ImageRgba8(image::imageops::rotate270(&img)),
        _ => img,
    }
}

fn downscale_to_limits(img: DynamicImage, limits: Option<&ImageLimits>) -> DynamicImage {
    let Some(l) = limits else {
        return img;
    };
    let (w, h) = img.dimensions();
    let mw = l.max_width.unwrap_or(w);
    let mh = l.max_height.unwrap_or(h);
    if w <= mw && h <= mh {
        return img;
    }
    tracing::debug!(from_w = w, from_h = h, max_w = mw, max_h = mh, "downscaling upload");
    // resize preserves aspect ratio and fits inside the box.
    img.resize(mw, mh, image::imageops::FilterType::CatmullRom)
}
