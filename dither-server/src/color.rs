use anyhow::{Result, anyhow};
use css_color::Srgb;

use crate::dither::Rgba;

/// Parse any CSS color (`#000`, `black`, `rgb(0 0 0 / 50%)`, ...) into RGBA8.
pub fn parse_css(input: &str) -> Result<Rgba> {
    let parsed = input
        .trim()
        .parse::<Srgb>()
        .map_err(|_| anyhow!("invalid css color '{input}'"))?;
    let rgba = [
        unit_to_u8(parsed.red),
        unit_to_u8(parsed.green),
        unit_to_u8(parsed.blue),
        unit_to_u8(parsed.alpha),
    ];
    tracing::trace!(input=%input, hex=%to_hex(rgba), "resolved color");
    Ok(rgba)
}

pub fn to_hex(c: Rgba) -> String {
    if c[3] == 255 {
        format!("#{:02x}{:02x}{:02x}", c[0], c[1], c[2])
    } else {
        format!("#{:02x}{:02x}{:02x}{:02x}", c[0], c[1], c[2], c[3])
    }
}

fn unit_to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}
