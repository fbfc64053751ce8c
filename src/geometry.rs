//! Frame geometry: letterbox, pad and crop parameters for the detector tensor.
//!
//! The transcoder scales the camera frame to fit a padded canvas, pads it to
//! that canvas and crops the detector's input window out of it. This module
//! computes those numbers and the inverse mapping that takes a detector-space
//! coordinate back to the original frame.

use anyhow::Result;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use crate::PipelineError;

/// Width and height of a video stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    /// Parses a stream size such as `"1920x1080"`.
    ///
    /// Surrounding text is ignored, so the size can be taken straight from a
    /// probe line like `"Video: h264, yuv420p, 720x1280, 30 fps"`.
    pub fn parse(raw: &str) -> Result<Self> {
        static SIZE_RE: OnceLock<Regex> = OnceLock::new();
        let re = SIZE_RE.get_or_init(|| Regex::new(r"\b(\d+)x(\d+)\b").expect("valid size regex"));

        let caps = re
            .captures(raw)
            .ok_or_else(|| PipelineError::invalid_config(format!("invalid stream size '{}'", raw)))?;
        let parse = |s: &str, axis: &str| {
            s.parse::<u32>().map_err(|e| {
                PipelineError::invalid_config(format!("invalid stream {} '{}': {}", axis, s, e))
            })
        };
        Ok(Self {
            width: parse(&caps[1], "width")?,
            height: parse(&caps[2], "height")?,
        })
    }
}

/// Crop window as percentages of the padded canvas, `[x, y, size]`.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(from = "[f64; 3]")]
pub struct Crop {
    pub x: f64,
    pub y: f64,
    pub size: f64,
}

impl From<[f64; 3]> for Crop {
    fn from([x, y, size]: [f64; 3]) -> Self {
        Self { x, y, size }
    }
}

impl Default for Crop {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            size: 100.0,
        }
    }
}

/// Everything the geometry calculation depends on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameGeometryInput {
    pub input_width: f64,
    pub input_height: f64,
    pub crop_x: f64,
    pub crop_y: f64,
    pub crop_size: f64,
    pub output_width: f64,
    pub output_height: f64,
}

impl FrameGeometryInput {
    pub fn new(input: FrameSize, crop: Crop, output_width: u32, output_height: u32) -> Self {
        Self {
            input_width: f64::from(input.width),
            input_height: f64::from(input.height),
            crop_x: crop.x,
            crop_y: crop.y,
            crop_size: crop.size,
            output_width: f64::from(output_width),
            output_height: f64::from(output_height),
        }
    }
}

/// Parameters of the inverse crop mapping.
///
/// `canvas_width` and `canvas_height` are the unrounded padded canvas size.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Uncrop {
    pub crop_x: f64,
    pub crop_y: f64,
    pub crop_size: f64,
    pub canvas_width: f64,
    pub canvas_height: f64,
}

impl Uncrop {
    /// Maps a normalized x inside the crop window to the padded canvas.
    pub fn x(&self, v: f32) -> f32 {
        uncrop_axis(v, self.canvas_width, self.crop_x, self.crop_size)
    }

    /// Maps a normalized y inside the crop window to the padded canvas.
    pub fn y(&self, v: f32) -> f32 {
        uncrop_axis(v, self.canvas_height, self.crop_y, self.crop_size)
    }
}

fn uncrop_axis(v: f32, canvas: f64, offset: f64, size: f64) -> f32 {
    let new_min = canvas * offset / 100.0;
    let new_max = canvas * (offset + size) / 100.0;
    let new_range = new_max - new_min;
    ((f64::from(v) * new_range + new_min) / canvas) as f32
}

/// Result of [`calculate`].
#[derive(Clone, Debug, PartialEq)]
pub struct FrameGeometry {
    pub padded_width: u32,
    pub padded_height: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub crop_offset_x: u32,
    pub crop_offset_y: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub pad_x_multiplier: f32,
    pub pad_y_multiplier: f32,
    pub uncrop: Uncrop,
}

impl FrameGeometry {
    /// Size in bytes of one RGB24 frame at the detector's input size.
    pub fn frame_size(&self) -> usize {
        self.output_width as usize * self.output_height as usize * 3
    }

    /// Detector-space x to original-frame fixed-point percent.
    pub fn frame_x(&self, v: f32) -> i32 {
        (self.uncrop.x(v) * self.pad_x_multiplier * 100.0) as i32
    }

    /// Detector-space y to original-frame fixed-point percent.
    pub fn frame_y(&self, v: f32) -> i32 {
        (self.uncrop.y(v) * self.pad_y_multiplier * 100.0) as i32
    }
}

/// Computes the scale, pad and crop parameters for one pipeline.
pub fn calculate(i: &FrameGeometryInput) -> Result<FrameGeometry> {
    if i.input_width < i.output_width {
        return Err(PipelineError::invalid_config(format!(
            "input width is less than output width, {}/{}",
            i.input_width, i.output_width
        ))
        .into());
    }
    if i.input_height < i.output_height {
        return Err(PipelineError::invalid_config(format!(
            "input height is less than output height, {}/{}",
            i.input_height, i.output_height
        ))
        .into());
    }

    let padded_width = i.output_width * 100.0 / i.crop_size;
    let padded_height = i.output_height * 100.0 / i.crop_size;

    let crop_offset_x = padded_width * i.crop_x / 100.0;
    let crop_offset_y = padded_height * i.crop_y / 100.0;

    let width_ratio = i.input_width / i.output_width;
    let height_ratio = i.input_height / i.output_height;

    let mut scaled_width = padded_width;
    let mut scaled_height = padded_height;
    let mut pad_x_multiplier = 1.0;
    let mut pad_y_multiplier = 1.0;

    if width_ratio > height_ratio {
        scaled_height = i.input_height * padded_width / i.input_width;
        pad_y_multiplier = padded_height / scaled_height;
    } else if width_ratio < height_ratio {
        scaled_width = i.input_width * padded_height / i.input_height;
        pad_x_multiplier = padded_width / scaled_width;
    }

    if !(scaled_width <= i.input_width) {
        return Err(PipelineError::invalid_config(format!(
            "scaled width is greater than input width: {}/{}",
            scaled_width, i.input_width
        ))
        .into());
    }
    if !(scaled_height <= i.input_height) {
        return Err(PipelineError::invalid_config(format!(
            "scaled height is greater than input height: {}/{}",
            scaled_height, i.input_height
        ))
        .into());
    }

    Ok(FrameGeometry {
        padded_width: padded_width as u32,
        padded_height: padded_height as u32,
        scaled_width: scaled_width as u32,
        scaled_height: scaled_height as u32,
        crop_offset_x: crop_offset_x as u32,
        crop_offset_y: crop_offset_y as u32,
        output_width: i.output_width as u32,
        output_height: i.output_height as u32,
        pad_x_multiplier: pad_x_multiplier as f32,
        pad_y_multiplier: pad_y_multiplier as f32,
        uncrop: Uncrop {
            crop_x: i.crop_x,
            crop_y: i.crop_y,
            crop_size: i.crop_size,
            canvas_width: padded_width,
            canvas_height: padded_height,
        },
    })
}
