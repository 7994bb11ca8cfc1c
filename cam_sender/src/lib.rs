pub mod sender;
pub mod sensors;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("camera error: {0}")]
    Camera(#[from] rscam::Error),

    #[error("no {0} supported by the camera")]
    Unsupported(&'static str),

    #[error("no JPEG files in {0}")]
    NoFrames(PathBuf),

    #[error("cannot encode message: {0}")]
    Encode(#[from] Box<bincode::ErrorKind>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
