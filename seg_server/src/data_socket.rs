//! Data socket receiving camera frames over TCP.
//!
//! A sender opens a connection, names its channel with a `ConnectReq` and then
//! streams `FrameMsg`s. Frames are published on the channel of the same name.
use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use bytes::Bytes;
use common::protocol::ProtoMsg;
use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{
    meter::METER,
    pubsub::{Frame, NamedPubSub},
    SegError,
};

/// Bind the data socket and serve it in a background task.
pub async fn spawn_data_socket(
    pubsub: Arc<NamedPubSub>,
    addr: &str,
) -> Result<JoinHandle<Result<()>>> {
    let socket: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(socket).await?;
    log::info!("Data socket listening on {}", listener.local_addr()?);
    Ok(tokio::spawn(serve_data_socket(listener, pubsub)))
}

pub async fn serve_data_socket(listener: TcpListener, pubsub: Arc<NamedPubSub>) -> Result<()> {
    loop {
        let (socket, _peer_addr) = listener.accept().await?;
        let pubsub = pubsub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_incoming(pubsub, socket).await {
                log::warn!("Data socket connection closed: {e}");
            }
        });
    }
}

async fn handle_incoming(pubsub: Arc<NamedPubSub>, stream: TcpStream) -> Result<()> {
    let addr = stream.peer_addr()?;
    log::info!("{}: New TCP connection", &addr);

    let mut transport = Framed::new(stream, LengthDelimitedCodec::new());

    let channel_name = match transport.next().await {
        Some(Ok(data)) => match ProtoMsg::deserialize(&data) {
            Ok(ProtoMsg::ConnectReq(channel)) => channel,
            _ => return Err(SegError::Protocol("first message must name a channel".into()).into()),
        },
        _ => return Err(SegError::Protocol("connection closed before naming a channel".into()).into()),
    };
    let publisher = pubsub.publish(&channel_name);
    log::info!("{}: Publishing channel {}", &addr, publisher.name());

    let mut order = SeqOrder::default();

    while let Some(res) = transport.next().await {
        let data = match res {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Error in TCP codec: {e}");
                continue;
            }
        };

        match ProtoMsg::deserialize(&data) {
            Ok(ProtoMsg::FrameMsg(msg)) => {
                if msg.channel != channel_name {
                    log::warn!(
                        "{}: Frame for channel {} on connection of {}",
                        &addr,
                        msg.channel,
                        &channel_name
                    );
                    continue;
                }
                if !order.accept(msg.seq) {
                    log::debug!("{}: Dropping out of order frame {}", &addr, msg.seq);
                    continue;
                }

                METER.tick_received();
                let frame = Frame {
                    seq: msg.seq,
                    jpeg: Bytes::from(msg.data),
                };
                publisher.send(frame);
            }
            Ok(ProtoMsg::ConnectReq(channel)) => {
                log::warn!("{}: Ignoring repeated connect request for {}", &addr, channel);
            }
            Err(e) => {
                log::warn!("{}: Undecodable message: {}", &addr, e);
            }
        }
    }

    log::info!("{}: TCP stream ended, closing channel {}", &addr, &channel_name);
    Ok(())
}

/// Accepts strictly increasing sequence numbers.
#[derive(Debug, Default)]
struct SeqOrder {
    last: Option<u64>,
}

impl SeqOrder {
    fn accept(&mut self, seq: u64) -> bool {
        if self.last.map_or(true, |last| seq > last) {
            self.last = Some(seq);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use futures::SinkExt;
    use tokio::{sync::broadcast::error::RecvError, time::timeout};

    use super::*;
    use crate::pubsub::FrameReceiver;
    use common::protocol::FrameMsg;

    #[test]
    fn test_seq_order() {
        let mut order = SeqOrder::default();
        assert!(order.accept(0));
        assert!(order.accept(2));
        assert!(!order.accept(2));
        assert!(!order.accept(1));
        assert!(order.accept(3));
    }

    async fn connect(addr: SocketAddr, channel: &str) -> Result<Framed<TcpStream, LengthDelimitedCodec>> {
        let stream = TcpStream::connect(addr).await?;
        let mut transport = Framed::new(stream, LengthDelimitedCodec::new());
        let req = ProtoMsg::ConnectReq(channel.into());
        transport.send(Bytes::from(req.serialize()?)).await?;
        Ok(transport)
    }

    /// Wait until the connection registered its channel.
    async fn subscribe(pubsub: &NamedPubSub, channel: &str) -> Result<FrameReceiver> {
        let rx = timeout(Duration::from_secs(2), async {
            loop {
                if let Some(rx) = pubsub.get_broadcast_receiver(channel) {
                    return rx;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        Ok(rx)
    }

    async fn serve(pubsub: Arc<NamedPubSub>) -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(serve_data_socket(listener, pubsub));
        Ok(addr)
    }

    #[tokio::test]
    async fn test_frames_are_published_in_order() -> Result<()> {
        let pubsub = Arc::new(NamedPubSub::new());
        let addr = serve(pubsub.clone()).await?;

        let mut transport = connect(addr, "front").await?;
        let mut rx = subscribe(&pubsub, "front").await?;
        for seq in [1, 3, 2, 4] {
            let msg = ProtoMsg::FrameMsg(FrameMsg::new("front".into(), seq, vec![seq as u8]));
            transport.send(Bytes::from(msg.serialize()?)).await?;
        }

        let mut seqs = Vec::new();
        for _ in 0..3 {
            seqs.push(rx.recv().await?.seq);
        }
        assert_eq!(seqs, vec![1, 3, 4]);

        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_closes_channel() -> Result<()> {
        let pubsub = Arc::new(NamedPubSub::new());
        let addr = serve(pubsub.clone()).await?;

        let mut transport = connect(addr, "door").await?;
        let mut rx = subscribe(&pubsub, "door").await?;
        let msg = ProtoMsg::FrameMsg(FrameMsg::new("door".into(), 1, vec![1]));
        transport.send(Bytes::from(msg.serialize()?)).await?;
        assert_eq!(rx.recv().await?.seq, 1);

        drop(transport);

        let res = timeout(Duration::from_secs(2), rx.recv()).await?;
        assert!(matches!(res, Err(RecvError::Closed)));
        assert!(pubsub.channels().is_empty());
        Ok(())
    }
}
