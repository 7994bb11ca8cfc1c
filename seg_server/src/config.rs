//! Command line and environment configuration of the server.
//!
use std::path::PathBuf;

use clap::Parser;

use crate::{
    loader::ModelSource,
    nn::{InputShape, Layout},
    pipeline::DetectParams,
};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Live YOLOv8 segmentation in the browser")]
pub struct ServerConfig {
    /// Address of the HTTP server
    #[clap(long, env = "SEGCAM_SERVER_ADDRESS", default_value = "127.0.0.1:3000")]
    pub server_address: String,

    /// Address of the data socket receiving camera frames
    #[clap(long, env = "SEGCAM_SOCKET_ADDRESS", default_value = "127.0.0.1:3001")]
    pub socket_address: String,

    /// Name of the model, resolved to `{model_base}/{model_name}_web_model/model.onnx`
    #[clap(long, env = "SEGCAM_MODEL_NAME", default_value = "yolov8n-seg")]
    pub model_name: String,

    /// Base URL or directory holding the model bundles
    #[clap(long, env = "SEGCAM_MODEL_BASE", default_value = "./public")]
    pub model_base: String,

    /// Fixed input size `WIDTHxHEIGHT` for models exported with dynamic input dimensions
    #[clap(long, value_parser = parse_input_size)]
    pub input_size: Option<(u32, u32)>,

    /// Tensor layout used with `--input-size`: `nchw` or `nhwc`
    #[clap(long, value_parser = parse_layout, default_value = "nchw")]
    pub input_layout: Layout,

    /// Do not cache downloaded models in the user cache directory
    #[clap(long)]
    pub no_cache: bool,

    /// Additional attempts after a failed model load
    #[clap(long, default_value_t = 0)]
    pub load_retries: u32,

    /// Minimum class score of a detection
    #[clap(long, env = "SEGCAM_CLASS_THRESHOLD", default_value_t = 0.2)]
    pub class_threshold: f32,

    /// IoU above which overlapping detections are suppressed
    #[clap(long, default_value_t = 0.45)]
    pub iou_threshold: f32,

    /// Mask probability above which a pixel belongs to the object
    #[clap(long, default_value_t = 0.5)]
    pub mask_threshold: f32,

    /// Maximum number of detections per frame
    #[clap(long, default_value_t = 100)]
    pub max_detections: usize,

    /// TrueType font used for labels; labels are omitted without it
    #[clap(long, env = "SEGCAM_FONT")]
    pub font: Option<PathBuf>,

    /// JSON file with an array of class names, COCO names are used otherwise
    #[clap(long)]
    pub labels: Option<PathBuf>,

    /// JPEG quality of annotated frames
    #[clap(long, default_value_t = 80)]
    pub jpeg_quality: i32,
}

impl ServerConfig {
    pub fn model_source(&self) -> ModelSource {
        ModelSource::resolve(&self.model_base, &self.model_name)
    }

    /// Input shape to pin the model to, if `--input-size` is set.
    pub fn input_shape(&self) -> Option<InputShape> {
        self.input_size
            .map(|(width, height)| InputShape::pinned(width as usize, height as usize, self.input_layout))
    }

    pub fn detect_params(&self) -> DetectParams {
        DetectParams {
            class_threshold: self.class_threshold.clamp(0.0, 1.0),
            iou_threshold: self.iou_threshold,
            mask_threshold: self.mask_threshold,
            max_detections: self.max_detections,
        }
    }

    /// Cache directory for downloaded models, if caching is enabled.
    pub fn cache_dir(&self) -> Option<PathBuf> {
        if self.no_cache {
            return None;
        }
        dirs::cache_dir().map(|dir| dir.join("segcam"))
    }
}

fn parse_input_size(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {value}"))?;
    let width = width.trim().parse::<u32>().map_err(|e| e.to_string())?;
    let height = height.trim().parse::<u32>().map_err(|e| e.to_string())?;
    if width == 0 || height == 0 {
        return Err("input size must not be zero".into());
    }
    Ok((width, height))
}

fn parse_layout(value: &str) -> Result<Layout, String> {
    match value.to_ascii_lowercase().as_str() {
        "nchw" => Ok(Layout::Nchw),
        "nhwc" => Ok(Layout::Nhwc),
        _ => Err(format!("expected nchw or nhwc, got {value}")),
    }
}
