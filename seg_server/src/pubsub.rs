//! Named broadcast channels carrying camera frames.
//!
//! A channel exists while at least one [`Publisher`] holds it. Viewers can
//! only subscribe to live channels, and once the last publisher is dropped
//! its receivers see `RecvError::Closed`.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 20;

/// One JPEG frame of a camera channel.
#[derive(Clone, Debug)]
pub struct Frame {
    pub seq: u64,
    pub jpeg: Bytes,
}

pub type FrameSender = broadcast::Sender<Frame>;
pub type FrameReceiver = broadcast::Receiver<Frame>;

struct Channel {
    tx: FrameSender,
    publishers: usize,
}

#[derive(Default)]
pub struct NamedPubSub {
    map: Mutex<HashMap<String, Channel>>,
}

impl NamedPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register as a publisher of `name`, creating the channel if needed.
    pub fn publish(self: &Arc<Self>, name: &str) -> Publisher {
        let mut map = self.lock();
        let channel = map.entry(name.to_owned()).or_insert_with(|| Channel {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
            publishers: 0,
        });
        channel.publishers += 1;

        Publisher {
            pubsub: self.clone(),
            name: name.to_owned(),
            tx: channel.tx.clone(),
        }
    }

    /// Subscribe to a channel. `None` if nobody publishes on it.
    pub fn get_broadcast_receiver(&self, name: &str) -> Option<FrameReceiver> {
        self.lock().get(name).map(|channel| channel.tx.subscribe())
    }

    /// Names of the channels that currently have a publisher.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn release(&self, name: &str) {
        let mut map = self.lock();
        if let Some(channel) = map.get_mut(name) {
            channel.publishers -= 1;
            if channel.publishers == 0 {
                map.remove(name);
                log::info!("Channel {} closed", name);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sending side of a channel. Dropping the last one closes the channel.
pub struct Publisher {
    pubsub: Arc<NamedPubSub>,
    name: String,
    tx: FrameSender,
}

impl Publisher {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a frame to the current viewers. Returns how many received it.
    pub fn send(&self, frame: Frame) -> usize {
        // No subscribers is not an error, the frame is just not shown
        self.tx.send(frame).unwrap_or(0)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.pubsub.release(&self.name);
    }
}
