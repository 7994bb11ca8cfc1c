//! Rendering detections onto the canvas overlay.
//!
//! The canvas has the model's input size. Like a canvas stretched over the
//! displayed media, detections are scaled per axis from frame to canvas
//! coordinates. The overlay is transparent except for masks, boxes and labels
//! and is composited over the frame for display.
use std::path::Path;

use image::{imageops::FilterType, DynamicImage, Pixel, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use lazy_static::lazy_static;
use rusttype::{Font, Scale};

use crate::{postproc::Detection, SegError};

const MASK_ALPHA: u8 = 102;
const LABEL_SCALE: f32 = 16.0;
const LINE_WIDTH: i32 = 2;

lazy_static! {
    /// Ultralytics colour palette, indexed by class id.
    static ref PALETTE: Vec<Rgb<u8>> = [
        "FF3838", "FF9D97", "FF701F", "FFB21D", "CFD231", "48F90A", "92CC17", "3DDB86",
        "1A9334", "00D4BB", "2C99A8", "00C2FF", "344593", "6473FF", "0018EC", "8438FF",
        "520085", "CB38FF", "FF95C8", "FF37C7",
    ]
    .iter()
    .filter_map(|hex| hex_to_rgb(hex))
    .collect();
}

fn hex_to_rgb(hex: &str) -> Option<Rgb<u8>> {
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    Some(Rgb([channel(0)?, channel(2)?, channel(4)?]))
}

pub fn class_color(class_id: usize) -> Rgb<u8> {
    PALETTE[class_id % PALETTE.len()]
}

/// Transparent overlay the detections are drawn on.
pub struct Canvas {
    overlay: RgbaImage,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            overlay: RgbaImage::new(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.overlay.width()
    }

    pub fn height(&self) -> u32 {
        self.overlay.height()
    }

    pub fn overlay(&self) -> &RgbaImage {
        &self.overlay
    }

    /// Remove everything drawn by the previous frame.
    pub fn clear(&mut self) {
        self.overlay.pixels_mut().for_each(|p| *p = Rgba([0, 0, 0, 0]));
    }

    /// Frame stretched to the canvas size with the overlay on top.
    pub fn composite(&self, frame: &RgbImage) -> RgbImage {
        let resized = image::imageops::resize(frame, self.width(), self.height(), FilterType::Triangle);
        let mut base = DynamicImage::ImageRgb8(resized).to_rgba8();
        image::imageops::overlay(&mut base, &self.overlay, 0, 0);
        DynamicImage::ImageRgba8(base).to_rgb8()
    }
}

#[derive(Clone)]
pub struct Renderer {
    font: Option<Font<'static>>,
}

impl Renderer {
    pub fn new(font: Option<Font<'static>>) -> Self {
        Self { font }
    }

    /// Renderer with the font at `path`. Labels are left out if it cannot be loaded.
    pub fn with_font_file(path: Option<&Path>) -> Self {
        let font = path.and_then(|path| match load_font(path) {
            Ok(font) => Some(font),
            Err(e) => {
                log::warn!("Labels disabled: {e}");
                None
            }
        });
        Self::new(font)
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Clear `canvas` and draw masks, boxes and labels of one frame.
    pub fn render(&self, canvas: &mut Canvas, detections: &[Detection], frame_size: (u32, u32)) {
        canvas.clear();
        if frame_size.0 == 0 || frame_size.1 == 0 {
            return;
        }
        let kx = canvas.width() as f32 / frame_size.0 as f32;
        let ky = canvas.height() as f32 / frame_size.1 as f32;

        // Masks first so boxes and labels stay readable
        for detection in detections {
            self.draw_mask(canvas, detection, kx, ky);
        }
        for detection in detections {
            self.draw_box(canvas, detection, kx, ky);
        }
    }

    fn draw_mask(&self, canvas: &mut Canvas, detection: &Detection, kx: f32, ky: f32) {
        let Some(mask) = detection.mask.as_ref() else {
            return;
        };
        let color = class_color(detection.class_id).to_rgba();
        let fill = Rgba([color[0], color[1], color[2], MASK_ALPHA]);

        let bbox = &detection.bbox;
        let x0 = (bbox.x * kx).floor().max(0.0) as u32;
        let y0 = (bbox.y * ky).floor().max(0.0) as u32;
        let x1 = ((bbox.x + bbox.width) * kx).ceil().min(canvas.width() as f32) as u32;
        let y1 = ((bbox.y + bbox.height) * ky).ceil().min(canvas.height() as f32) as u32;

        for y in y0..y1 {
            for x in x0..x1 {
                let frame_x = ((x as f32 + 0.5) / kx) as u32;
                let frame_y = ((y as f32 + 0.5) / ky) as u32;
                if mask.contains(frame_x, frame_y) {
                    canvas.overlay.get_pixel_mut(x, y).blend(&fill);
                }
            }
        }
    }

    fn draw_box(&self, canvas: &mut Canvas, detection: &Detection, kx: f32, ky: f32) {
        let color = class_color(detection.class_id).to_rgba();
        let bbox = &detection.bbox;
        let x = (bbox.x * kx).round() as i32;
        let y = (bbox.y * ky).round() as i32;
        let width = (bbox.width * kx).round() as i32;
        let height = (bbox.height * ky).round() as i32;

        for t in 0..LINE_WIDTH {
            let (w, h) = (width - 2 * t, height - 2 * t);
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(x + t, y + t).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut canvas.overlay, rect, color);
        }

        if let Some(font) = self.font.as_ref() {
            let scale = Scale::uniform(LABEL_SCALE);
            let text = format!("{} - {:.1}%", detection.label, detection.score * 100.0);
            let (text_width, text_height) = text_size(scale, font, &text);
            // Above the box, or inside it at the top edge of the canvas
            let label_y = match y - text_height - 2 {
                above if above >= 0 => above,
                _ => y.max(0),
            };

            let background = Rect::at(x, label_y).of_size(
                (text_width + 4).max(1) as u32,
                (text_height + 2).max(1) as u32,
            );
            draw_filled_rect_mut(&mut canvas.overlay, background, color);
            draw_text_mut(
                &mut canvas.overlay,
                Rgba([255, 255, 255, 255]),
                x + 2,
                label_y + 1,
                scale,
                font,
                &text,
            );
        }
    }
}

/// Load a TrueType font from disk.
pub fn load_font(path: &Path) -> Result<Font<'static>, SegError> {
    let font_data = std::fs::read(path)?;
    Font::try_from_vec(font_data)
        .ok_or_else(|| SegError::UnsupportedInput(format!("{} is not a font", path.display())))
}
