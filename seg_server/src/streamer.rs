//! MJPEG streams of camera channels, raw and annotated.
//!
use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use image::RgbImage;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    meter::METER,
    pipeline::{run_detection, DetectOutcome},
    pubsub::{Frame, FrameReceiver},
    shell::{ActivityGuard, Session, ShellStore},
    SegError,
};

pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Wrap a JPEG as one part of a `multipart/x-mixed-replace` body.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}

pub fn decode_jpeg(data: &[u8]) -> Result<RgbImage, SegError> {
    turbojpeg::decompress_image(data)
        .map_err(|e| SegError::UnsupportedInput(format!("cannot decode JPEG: {e}")))
}

pub fn encode_jpeg(image: &RgbImage, quality: i32) -> Result<Vec<u8>, SegError> {
    let buf = turbojpeg::compress_image(image, quality, turbojpeg::Subsamp::Sub2x2)
        .map_err(|e| SegError::UnsupportedInput(format!("cannot encode JPEG: {e}")))?;
    Ok(buf.to_vec())
}

/// Frames of a channel as they arrive.
pub fn raw_stream(rx: FrameReceiver) -> impl Stream<Item = Result<Bytes, Infallible>> {
    BroadcastStream::new(rx)
        .filter_map(|res| async move { res.ok() })
        .map(|frame| Ok(as_jpeg_stream_item(&frame.jpeg)))
}

/// Annotated frames of a channel.
///
/// Frames that arrive while a detection runs are skipped, so the stream
/// always continues with the newest frame. The stream keeps the store in
/// `VideoStreaming` until it is dropped.
pub fn annotated_stream(
    store: Arc<ShellStore>,
    guard: ActivityGuard,
    session: Session,
    mut rx: FrameReceiver,
    jpeg_quality: i32,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    async_stream::stream! {
        let _guard = guard;

        while let Some(frame) = next_newest(&mut rx).await {
            let store = store.clone();
            let session = session.clone();
            let seq = frame.seq;
            let res = tokio::task::spawn_blocking(move || {
                annotate(&frame.jpeg, &store, &session, jpeg_quality)
            })
            .await;

            match res {
                Ok(Ok(Some(jpeg))) => {
                    METER.tick_detected();
                    yield Ok(as_jpeg_stream_item(&jpeg));
                }
                Ok(Ok(None)) => log::debug!("Frame {seq} was superseded"),
                Ok(Err(e)) => log::warn!("Skipping frame {seq}: {e}"),
                Err(e) => log::error!("Detection task for frame {seq} failed: {e}"),
            }
        }

        log::info!("Camera channel closed, ending stream");
    }
}

/// Wait for a frame, then skip ahead to the newest one queued.
async fn next_newest(rx: &mut FrameReceiver) -> Option<Frame> {
    let mut newest = loop {
        match rx.recv().await {
            Ok(frame) => break frame,
            Err(RecvError::Lagged(skipped)) => METER.add_dropped(skipped),
            Err(RecvError::Closed) => return None,
        }
    };

    loop {
        match rx.try_recv() {
            Ok(frame) => {
                METER.add_dropped(1);
                newest = frame;
            }
            Err(TryRecvError::Lagged(skipped)) => METER.add_dropped(skipped),
            Err(_) => return Some(newest),
        }
    }
}

/// Detect on one camera frame.
///
/// `None` if another detection on the same overlay started or drew first.
fn annotate(
    jpeg: &[u8],
    store: &ShellStore,
    session: &Session,
    jpeg_quality: i32,
) -> Result<Option<Vec<u8>>, SegError> {
    let ticket = session.overlay.ticket();
    let frame = decode_jpeg(jpeg)?;
    if session.overlay.is_superseded(ticket) {
        return Ok(None);
    }

    let detections = run_detection(
        session.model.model.as_ref(),
        &frame,
        store.labels(),
        store.params(),
    )?;

    match session.overlay.draw(ticket, &frame, detections) {
        DetectOutcome::Drawn { frame, .. } => encode_jpeg(&frame, jpeg_quality).map(Some),
        DetectOutcome::Stale => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use ndarray::{Array4, ArrayD, IxDyn};
    use tokio::{sync::broadcast, time::timeout};

    use super::*;
    use crate::{
        labels::Labels,
        nn::{InferModel, InputShape, ModelHandle},
        pipeline::DetectParams,
        render::Renderer,
        shell::Activity,
    };

    /// Finds one person in the middle of every 32x32 input.
    struct OnePersonModel;

    impl InferModel for OnePersonModel {
        fn input_shape(&self) -> InputShape {
            InputShape::from_dims(&[1, 3, 32, 32]).unwrap()
        }

        fn run(&self, _input: Array4<f32>) -> Result<Vec<ArrayD<f32>>, SegError> {
            let mut out = ArrayD::zeros(IxDyn(&[1, 84, 100]));
            for (row, value) in [16.0, 16.0, 8.0, 8.0, 0.9].into_iter().enumerate() {
                out[[0, row, 0]] = value;
            }
            Ok(vec![out])
        }
    }

    fn ready_store() -> Result<Arc<ShellStore>, SegError> {
        let store = Arc::new(ShellStore::new(
            "test",
            Labels::default(),
            DetectParams::default(),
            Renderer::new(None),
        ));
        store.set_ready(ModelHandle::new(Arc::new(OnePersonModel))?);
        Ok(store)
    }

    fn camera_frame(seq: u64) -> Result<Frame, SegError> {
        let image = RgbImage::from_pixel(64, 48, image::Rgb([90, 90, 90]));
        Ok(Frame {
            seq,
            jpeg: Bytes::from(encode_jpeg(&image, 80)?),
        })
    }

    fn frame(seq: u64) -> Frame {
        Frame {
            seq,
            jpeg: Bytes::from_static(b"jpeg"),
        }
    }

    #[test]
    fn test_stream_item_framing() {
        let item = as_jpeg_stream_item(b"abc");
        assert!(item.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\nabc"));
        assert!(item.ends_with(b"\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_next_newest_skips_queued_frames() {
        let (tx, mut rx) = broadcast::channel(8);
        for seq in 1..=3 {
            tx.send(frame(seq)).unwrap();
        }

        let newest = next_newest(&mut rx).await.unwrap();
        assert_eq!(newest.seq, 3);

        tx.send(frame(4)).unwrap();
        assert_eq!(next_newest(&mut rx).await.unwrap().seq, 4);

        drop(tx);
        assert!(next_newest(&mut rx).await.is_none());
    }

    #[test]
    fn test_jpeg_roundtrip_keeps_size() -> Result<(), SegError> {
        let image = RgbImage::from_pixel(24, 16, image::Rgb([200, 10, 10]));
        let decoded = decode_jpeg(&encode_jpeg(&image, 90)?)?;
        assert_eq!(decoded.dimensions(), (24, 16));
        assert!(decode_jpeg(b"not a jpeg").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_annotated_stream_until_channel_closes() -> Result<(), SegError> {
        let store = ready_store()?;
        let (tx, rx) = broadcast::channel(8);
        let (guard, session) = store.begin_stream(None)?;
        let mut stream = Box::pin(annotated_stream(store.clone(), guard, session, rx, 80));
        assert_eq!(store.activity(), Activity::VideoStreaming);

        tx.send(camera_frame(1)?).unwrap();
        let part = timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        let header_len = "--frame\r\nContent-Type: image/jpeg\r\n\r\n".len();
        let jpeg = &part[header_len..part.len() - 4];
        // The annotated frame has the canvas size, which is the model input size
        assert_eq!(decode_jpeg(jpeg)?.dimensions(), (32, 32));

        // An undecodable frame is skipped, then the camera goes away
        tx.send(Frame {
            seq: 2,
            jpeg: Bytes::from_static(b"not a jpeg"),
        })
        .unwrap();
        drop(tx);

        let rest: Vec<_> = timeout(Duration::from_secs(5), stream.as_mut().collect::<Vec<_>>())
            .await
            .unwrap();
        assert!(rest.is_empty());

        // The finished stream released its activity
        assert_eq!(store.activity(), Activity::Idle);
        drop(stream);
        assert_eq!(store.activity(), Activity::Idle);
        Ok(())
    }
}
