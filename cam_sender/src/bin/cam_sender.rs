use std::path::PathBuf;

use anyhow::Result;
use cam_sender::{
    sender::{connect, send_frames, SendOptions},
    sensors::{CameraSource, DirectorySource, FrameSource},
};
use clap::Parser;
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address of the data socket of the server
    #[clap(long, env = "SEGCAM_SOCKET_ADDRESS", default_value = "127.0.0.1:3001")]
    address: String,

    /// Channel name that this sender publishes to
    #[clap(long, default_value = "unknown")]
    channel: String,

    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Replay the JPEG files of this directory instead of capturing
    #[clap(long)]
    frames_dir: Option<PathBuf>,

    /// Upper bound of frames per second
    #[clap(long)]
    fps: Option<f32>,

    /// Stop after this many frames
    #[clap(long)]
    max_frames: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    log::info!("Launching socket sender for channel {}", &args.channel);

    let mut source: Box<dyn FrameSource> = match &args.frames_dir {
        Some(dir) => Box::new(DirectorySource::open(dir)?),
        None => Box::new(CameraSource::open(&args.device, None, None)?),
    };

    let stream = connect(&args.address).await?;
    let options = SendOptions {
        channel: args.channel.clone(),
        fps: args.fps,
        max_frames: args.max_frames,
    };
    let sent = send_frames(stream, source.as_mut(), &options).await?;
    log::info!("Sent {sent} frames to {}", &args.channel);

    Ok(())
}
