//! Error type of the segmentation server.
//!
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SegError {
    /// Model artifact could not be fetched.
    #[error("failed to fetch model from {url}: {reason}")]
    ModelFetch { url: String, reason: String },

    /// Model artifact was fetched but is not a usable graph.
    #[error("invalid model: {0}")]
    ModelFormat(String),

    #[error("input shape {actual:?} does not match model input shape {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Media that cannot be decoded or is empty.
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("inference failed: {0}")]
    Inference(#[source] anyhow::Error),

    #[error("model is not loaded yet")]
    NotReady,

    #[error("no camera is publishing on channel {0}")]
    UnknownChannel(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SegError {
    pub(crate) fn fetch(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::ModelFetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}
