//! Frame sources: a V4L2 camera or a directory of JPEG files.
//!
use std::{
    fs,
    path::{Path, PathBuf},
};

use rscam::{Camera, Config};

use crate::SenderError;

/// Produces JPEG frames one by one.
pub trait FrameSource: Send {
    /// Next frame, `None` if the source cannot deliver one right now.
    fn next_frame(&mut self) -> Option<Vec<u8>>;
}

/// MJPG camera on a Linux machine.
pub struct CameraSource {
    cam: Camera,
}

impl CameraSource {
    /// Open `device_name`, using the highest resolution and frame rate unless given.
    pub fn open(
        device_name: &str,
        resolution: Option<(u32, u32)>,
        frame_rate: Option<(u32, u32)>,
    ) -> Result<Self, SenderError> {
        let mut cam = Camera::new(device_name)?;
        let format = b"MJPG";
        log_supported_formats(&cam);

        log::info!("Using camera {}", device_name);

        let resolution = match resolution {
            Some(resolution) => resolution,
            None => get_max_resolution(&cam, format)?,
        };
        let frame_rate = match frame_rate {
            Some(frame_rate) => frame_rate,
            None => get_max_frame_rate(&cam, format, resolution)?,
        };
        log::info!(
            "Capturing {}x{} at {}/{} s per frame",
            resolution.0,
            resolution.1,
            frame_rate.0,
            frame_rate.1
        );

        cam.start(&Config {
            interval: frame_rate,
            resolution,
            format,
            ..Default::default()
        })?;

        Ok(Self { cam })
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Option<Vec<u8>> {
        match self.cam.capture() {
            Ok(frame) => Some(frame[..].to_vec()),
            Err(e) => {
                log::warn!("Capture failed: {e}");
                None
            }
        }
    }
}

/// Replays the JPEG files of a directory in name order, over and over.
pub struct DirectorySource {
    files: Vec<PathBuf>,
    next: usize,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self, SenderError> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map_or(false, |ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            })
            .collect();
        if files.is_empty() {
            return Err(SenderError::NoFrames(dir.to_path_buf()));
        }
        files.sort();
        log::info!("Replaying {} frames from {}", files.len(), dir.display());

        Ok(Self { files, next: 0 })
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Option<Vec<u8>> {
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();
        match fs::read(path) {
            Ok(data) => Some(data),
            Err(e) => {
                log::warn!("Cannot read {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32), SenderError> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        // Highest resolution in terms of number of pixels
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .into_iter()
            .max_by_key(|(width, height)| width * height),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or(SenderError::Unsupported("resolution"))
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32), SenderError> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        // Intervals are (numerator, denominator) seconds per frame
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .into_iter()
            .filter(|(numerator, _)| *numerator > 0)
            .max_by_key(|(numerator, denominator)| denominator / numerator),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or(SenderError::Unsupported("frame rate"))
}

fn log_supported_formats(cam: &Camera) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!("Supported formats: {:?}", formats);
}
