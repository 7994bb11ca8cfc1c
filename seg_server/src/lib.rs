pub mod config;
pub mod data_socket;
pub mod endpoints;
pub mod error;
pub mod fetch;
pub mod labels;
pub mod loader;
pub mod meter;
pub mod nn;
pub mod pipeline;
pub mod postproc;
pub mod preproc;
pub mod pubsub;
pub mod render;
pub mod shell;
pub mod streamer;

pub use error::SegError;
