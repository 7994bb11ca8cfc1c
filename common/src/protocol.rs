//! Protocol definition for the data socket.
//!
//! A sender opens a TCP connection, announces the channel it publishes to with
//! a `ConnectReq` and then streams `FrameMsg`s. Every message travels in its own
//! length-delimited frame, encoded with `bincode`.
use serde::{Deserialize, Serialize};

/// Definition of protocol messages.
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ProtoMsg {
    ConnectReq(String),
    FrameMsg(FrameMsg),
}

/// A single JPEG-encoded frame of a named channel.
///
/// `seq` increases by one per captured frame so the receiver can discard frames
/// that arrive out of order.
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FrameMsg {
    pub channel: String,
    pub seq: u64,
    pub data: Vec<u8>,
}

impl FrameMsg {
    pub fn new(channel: String, seq: u64, data: Vec<u8>) -> Self {
        Self { channel, seq, data }
    }
}

impl ProtoMsg {
    pub fn serialize(&self) -> Result<Vec<u8>, Box<bincode::ErrorKind>> {
        bincode::serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, Box<bincode::ErrorKind>> {
        bincode::deserialize(bytes)
    }
}
