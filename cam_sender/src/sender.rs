//! Pushing frames to the data socket of the server.
//!
use std::time::Duration;

use bytes::Bytes;
use common::protocol::{FrameMsg, ProtoMsg};
use futures::sink::SinkExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::{interval, MissedTickBehavior},
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{sensors::FrameSource, SenderError};

#[derive(Clone, Debug)]
pub struct SendOptions {
    pub channel: String,
    /// Upper bound of frames per second, unlimited if `None`.
    pub fps: Option<f32>,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
}

pub async fn connect(address: &str) -> Result<TcpStream, SenderError> {
    let stream = TcpStream::connect(address).await?;
    log::info!("Connected to {}", address);
    Ok(stream)
}

/// Announce the channel and stream frames from `source` until it is exhausted
/// or `max_frames` frames were sent.
pub async fn send_frames<T, S>(io: T, source: &mut S, options: &SendOptions) -> Result<u64, SenderError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: FrameSource + ?Sized,
{
    // Wrap stream in transport handler with length-delimited codec
    let mut transport = Framed::new(io, LengthDelimitedCodec::new());

    let init_msg = ProtoMsg::ConnectReq(options.channel.clone()).serialize()?;
    transport.send(Bytes::from(init_msg)).await?;

    let mut pace = options.fps.filter(|fps| *fps > 0.0).map(|fps| {
        let mut pace = interval(Duration::from_secs_f32(1.0 / fps));
        pace.set_missed_tick_behavior(MissedTickBehavior::Skip);
        pace
    });

    let mut seq = 0;
    while options.max_frames.map_or(true, |max| seq < max) {
        if let Some(pace) = pace.as_mut() {
            pace.tick().await;
        }

        match source.next_frame() {
            Some(frame) => {
                let msg = ProtoMsg::FrameMsg(FrameMsg::new(options.channel.clone(), seq, frame));
                transport.send(Bytes::from(msg.serialize()?)).await?;
                log::debug!("Sent frame {seq}");
                seq += 1;
            }
            None => log::error!("Unable to capture frame, trying again..."),
        }
    }

    Ok(seq)
}
