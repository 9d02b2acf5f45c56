//! Messages crossing the worker boundary.
//!
//! A request carries the source raster and parameters; the response carries the
//! dithered raster and echoes `pixelSize`/`cutoff` so asynchronous replies can be
//! matched without extra bookkeeping.

use serde::{Deserialize, Serialize};

use crate::dither::{self, DitherError, DitherParams, OPAQUE_BLACK, OPAQUE_WHITE, RasterImage, Rgba};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DitherRequest {
    pub image_data: RasterImage,
    pub pixel_size: i32,
    pub cutoff: f32,
    #[serde(default = "default_black")]
    pub black_color: Rgba,
    #[serde(default = "default_white")]
    pub white_color: Rgba,
}

fn default_black() -> Rgba {
    OPAQUE_BLACK
}

fn default_white() -> Rgba {
    OPAQUE_WHITE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DitherResponse {
    pub image_data: RasterImage,
    pub pixel_size: i32,
    pub cutoff: f32,
}

impl DitherRequest {
    pub fn new(image_data: RasterImage, params: DitherParams) -> Self {
        Self {
            image_data,
            pixel_size: params.pixel_size,
            cutoff: params.cutoff,
            black_color: params.black_color,
            white_color: params.white_color,
        }
    }

    pub fn params(&self) -> DitherParams {
        DitherParams {
            pixel_size: self.pixel_size,
            cutoff: self.cutoff,
            black_color: self.black_color,
            white_color: self.white_color,
        }
    }

    /// Reject bad parameters or a mismatched pixel buffer without running the engine.
    pub fn validate(&self) -> Result<(), DitherError> {
        self.params().validate()?;
        self.image_data.validate()
    }

    /// Run the engine on this request, consuming it.
    pub fn process(self) -> Result<DitherResponse, DitherError> {
        let image_data = dither::dither(&self.image_data, &self.params())?;
        Ok(DitherResponse {
            image_data,
            pixel_size: self.pixel_size,
            cutoff: self.cutoff,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_is_camel_case() {
        let raw = json!({
            "imageData": { "width": 1, "height": 1, "data": [10, 10, 10, 255] },
            "pixelSize": 3,
            "cutoff": 0.25,
            "blackColor": [1, 2, 3, 255],
            "whiteColor": [250, 251, 252, 255]
        });
        let req: DitherRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.pixel_size, 3);
        assert_eq!(req.black_color, [1, 2, 3, 255]);

        let resp = req.process().unwrap();
        let out = serde_json::to_value(&resp).unwrap();
        assert_eq!(out["pixelSize"], 3);
        assert_eq!(out["cutoff"], 0.25);
        assert_eq!(out["imageData"]["width"], 3);
        assert_eq!(out["imageData"]["height"], 3);
        // gray 10 is below the 63.75 threshold
        assert_eq!(out["imageData"]["data"][0], 1);
    }

    #[test]
    fn colors_default_to_black_and_white() {
        let raw = json!({
            "imageData": { "width": 1, "height": 1, "data": [255, 255, 255, 255] },
            "pixelSize": 1,
            "cutoff": 0.5
        });
        let req: DitherRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.black_color, OPAQUE_BLACK);
        assert_eq!(req.white_color, OPAQUE_WHITE);
        let resp = req.process().unwrap();
        assert_eq!(resp.image_data.data, vec![255, 255, 255, 255]);
    }

    #[test]
    fn process_reports_engine_errors() {
        let req = DitherRequest::new(
            RasterImage::filled(2, 2, OPAQUE_WHITE),
            DitherParams {
                pixel_size: 0,
                ..DitherParams::default()
            },
        );
        assert!(matches!(
            req.validate(),
            Err(DitherError::InvalidParameter(_))
        ));
        assert!(matches!(
            req.process(),
            Err(DitherError::InvalidParameter(_))
        ));
    }

    #[test]
    fn validate_catches_short_buffers() {
        let raw = json!({
            "imageData": { "width": 2000, "height": 2000, "data": [] },
            "pixelSize": 1,
            "cutoff": 0.5
        });
        let req: DitherRequest = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            req.validate(),
            Err(DitherError::MalformedInput(_))
        ));
    }
}
