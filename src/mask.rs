//! Polygon masks overlaid on the scaled frame before it reaches the detector.
//!
//! The mask image is transparent inside the polygon and opaque outside it, so
//! only the selected area of the frame is visible to the detector.

use anyhow::{Context, Result};
use image::{GrayAlphaImage, ImageFormat, LumaA};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::PipelineError;

const VISIBLE: LumaA<u8> = LumaA([0, 0]);
const MASKED: LumaA<u8> = LumaA([255, 255]);

/// Mask setting of a monitor, `{"enable": bool, "area": [[x, y], ...]}`.
///
/// Points are percentages of the frame, `0..=100` on both axes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Mask {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub area: Vec<[f64; 2]>,
}

impl Mask {
    /// Parses the raw JSON setting. An empty string is a disabled mask.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let mask: Mask = serde_json::from_str(raw)
            .map_err(|e| PipelineError::invalid_config(format!("unmarshal mask: {}", e)))?;
        mask.validate()?;
        Ok(mask)
    }

    fn validate(&self) -> Result<()> {
        if !self.enable {
            return Ok(());
        }
        if self.area.len() < 3 {
            return Err(PipelineError::invalid_config(format!(
                "mask needs at least 3 points, got {}",
                self.area.len()
            ))
            .into());
        }
        Ok(())
    }

    /// Converts the percentage polygon to pixel coordinates of a `w`x`h` image.
    pub fn to_absolute(&self, w: u32, h: u32) -> Vec<[i64; 2]> {
        self.area
            .iter()
            .map(|[x, y]| {
                [
                    (x * f64::from(w) / 100.0) as i64,
                    (y * f64::from(h) / 100.0) as i64,
                ]
            })
            .collect()
    }
}

/// Rasterizes `poly` into a `w`x`h` mask image.
pub fn rasterize(w: u32, h: u32, poly: &[[i64; 2]]) -> GrayAlphaImage {
    GrayAlphaImage::from_fn(w, h, |x, y| {
        if inside_polygon(i64::from(x), i64::from(y), poly) {
            VISIBLE
        } else {
            MASKED
        }
    })
}

/// Even-odd ray casting test.
fn inside_polygon(x: i64, y: i64, poly: &[[i64; 2]]) -> bool {
    let mut inside = false;
    let Some(mut j) = poly.len().checked_sub(1) else {
        return false;
    };
    for i in 0..poly.len() {
        let [xi, yi] = poly[i];
        let [xj, yj] = poly[j];
        if (yi > y) != (yj > y) {
            let cross = (xj - xi) as f64 * (y - yi) as f64 / (yj - yi) as f64 + xi as f64;
            if (x as f64) < cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Renders an enabled mask at the scaled frame size and writes it as PNG.
///
/// Returns the written path, or `None` when the mask is disabled.
pub fn write_mask(path: &Path, mask: &Mask, w: u32, h: u32) -> Result<Option<PathBuf>> {
    if !mask.enable {
        return Ok(None);
    }
    let img = rasterize(w, h, &mask.to_absolute(w, h));

    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("remove old mask {}", path.display()));
        }
    }
    img.save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("save mask {}", path.display()))?;
    Ok(Some(path.to_path_buf()))
}
