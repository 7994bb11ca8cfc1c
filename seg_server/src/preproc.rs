//! Frame preprocessing: letterbox into the model input tensor.
//!
use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;

use crate::{
    nn::{InputShape, Layout},
    SegError,
};

/// Geometry of a letterboxed frame.
///
/// The frame is padded to a square of its longer side, anchored top-left, and
/// that square is resized to the model input. Model coordinates map back to
/// frame coordinates by dividing through the per-axis scale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub frame_width: u32,
    pub frame_height: u32,
    pub scale_x: f32,
    pub scale_y: f32,
}

impl Letterbox {
    pub fn new(frame_width: u32, frame_height: u32, input: &InputShape) -> Self {
        let max_size = frame_width.max(frame_height) as f32;
        Self {
            frame_width,
            frame_height,
            scale_x: input.width as f32 / max_size,
            scale_y: input.height as f32 / max_size,
        }
    }

    /// Size of the frame content inside the model input.
    pub fn content_size(&self) -> (u32, u32) {
        (
            ((self.frame_width as f32 * self.scale_x).round() as u32).max(1),
            ((self.frame_height as f32 * self.scale_y).round() as u32).max(1),
        )
    }

    /// Map a point from model input coordinates to frame coordinates.
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (x / self.scale_x, y / self.scale_y)
    }

    /// Map a point from frame coordinates to model input coordinates.
    pub fn to_input(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale_x, y * self.scale_y)
    }
}

/// Letterbox `frame` into a normalized `[0, 1]` tensor of the model's shape.
pub fn preprocess(frame: &RgbImage, input: &InputShape) -> Result<(Array4<f32>, Letterbox), SegError> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return Err(SegError::UnsupportedInput("empty frame".into()));
    }

    let letterbox = Letterbox::new(width, height, input);
    let (content_width, content_height) = letterbox.content_size();
    let resized = image::imageops::resize(frame, content_width, content_height, FilterType::Triangle);

    // Padding stays zero (black)
    let mut tensor = Array4::<f32>::zeros(input.dims());
    let rows = (content_height as usize).min(input.height);
    let cols = (content_width as usize).min(input.width);
    for y in 0..rows {
        for x in 0..cols {
            let pixel = resized.get_pixel(x as u32, y as u32);
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                match input.layout {
                    Layout::Nchw => tensor[[0, c, y, x]] = value,
                    Layout::Nhwc => tensor[[0, y, x, c]] = value,
                }
            }
        }
    }

    Ok((tensor, letterbox))
}
