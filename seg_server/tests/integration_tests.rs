use std::{
    io::Cursor,
    net::{SocketAddr, TcpListener},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    routing::get,
    Router,
};
use bytes::Bytes;
use hyper::body::HttpBody;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use ndarray::{Array4, ArrayD, IxDyn};
use seg_server::{
    endpoints::{router, HttpSettings},
    labels::Labels,
    loader::{ModelLoader, ModelSource},
    nn::{InferModel, InputShape, ModelHandle},
    pipeline::{detect, run_detection, DetectOutcome, DetectParams},
    pubsub::{Frame, NamedPubSub},
    render::Renderer,
    shell::{Activity, ShellStore},
    SegError,
};
use tokio::time::timeout;
use tower::ServiceExt;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const NUM_CLASSES: usize = 80;
const NUM_MASKS: usize = 32;
const NUM_CANDIDATES: usize = 200;
const PROTO_SIZE: usize = 16;

/// Segmentation model with a 64x64 input that sees one person in every
/// non-black frame. Black frames, like the warm-up input, show a car instead.
struct ScriptedModel {
    runs: AtomicUsize,
}

impl ScriptedModel {
    fn new() -> Self {
        Self {
            runs: AtomicUsize::new(0),
        }
    }
}

impl InferModel for ScriptedModel {
    fn input_shape(&self) -> InputShape {
        InputShape::from_dims(&[1, 3, 64, 64]).unwrap()
    }

    fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>, SegError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let mut boxes = ArrayD::zeros(IxDyn(&[1, 4 + NUM_CLASSES + NUM_MASKS, NUM_CANDIDATES]));

        let (class_id, geometry) = match input.iter().any(|&v| v > 0.0) {
            true => (0, [32.0, 16.0, 32.0, 16.0]),
            false => (2, [10.0, 10.0, 8.0, 8.0]),
        };
        for (feature, value) in geometry.into_iter().enumerate() {
            boxes[[0, feature, 0]] = value;
        }
        boxes[[0, 4 + class_id, 0]] = 0.9;
        // A weak duplicate below the default threshold
        boxes[[0, 0, 1]] = 30.0;
        boxes[[0, 1, 1]] = 16.0;
        boxes[[0, 2, 1]] = 30.0;
        boxes[[0, 3, 1]] = 16.0;
        boxes[[0, 4 + 1, 1]] = 0.1;

        let protos = ArrayD::from_elem(IxDyn(&[1, NUM_MASKS, PROTO_SIZE, PROTO_SIZE]), 0.0);
        Ok(vec![boxes, protos])
    }
}

fn ready_store() -> Result<Arc<ShellStore>, SegError> {
    let store = Arc::new(ShellStore::new(
        "scripted",
        Labels::default(),
        DetectParams::default(),
        Renderer::new(None),
    ));
    store.set_ready(ModelHandle::new(Arc::new(ScriptedModel::new()))?);
    Ok(store)
}

fn loading_store() -> Arc<ShellStore> {
    Arc::new(ShellStore::new(
        "scripted",
        Labels::default(),
        DetectParams::default(),
        Renderer::new(None),
    ))
}

fn app(store: Arc<ShellStore>) -> Router {
    app_with(store, Arc::new(NamedPubSub::new()))
}

fn app_with(store: Arc<ShellStore>, pubsub: Arc<NamedPubSub>) -> Router {
    router(store, pubsub, HttpSettings { jpeg_quality: 80 })
}

fn gray_frame(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([120, 120, 120]))
}

fn multipart_upload(image: &RgbImage) -> Result<(String, Vec<u8>), Box<dyn std::error::Error>> {
    let mut png = Vec::new();
    DynamicImage::ImageRgb8(image.clone()).write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)?;

    let boundary = "segcam-boundary";
    let mut body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"frame.png\"\r\nContent-Type: image/png\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(&png);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Ok((format!("multipart/form-data; boundary={boundary}"), body))
}

fn camera_frame(seq: u64) -> Result<Frame, Box<dyn std::error::Error>> {
    let mut jpeg = Vec::new();
    DynamicImage::ImageRgb8(gray_frame(96, 64)).write_to(&mut Cursor::new(&mut jpeg), ImageOutputFormat::Jpeg(80))?;
    Ok(Frame {
        seq,
        jpeg: Bytes::from(jpeg),
    })
}

/// Serve `app` on a loopback port.
fn serve(app: Router) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let server = axum::Server::from_tcp(listener)?.serve(app.into_make_service());
    tokio::spawn(server);
    Ok(addr)
}

#[test]
fn test_one_known_object() -> TestResult {
    let model = ScriptedModel::new();
    let frame = gray_frame(128, 64);

    let detections = run_detection(&model, &frame, &Labels::default(), &DetectParams::default())?;

    assert_eq!(detections.len(), 1);
    let person = &detections[0];
    assert_eq!(person.label, "person");
    assert_eq!(person.score, 0.9);
    // 128x64 frame letterboxed into 64x64 halves every coordinate
    let expected = [32.0, 16.0, 64.0, 32.0];
    let actual = [person.bbox.x, person.bbox.y, person.bbox.width, person.bbox.height];
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!((a - e).abs() <= 1.0, "box {actual:?} differs from {expected:?}");
    }
    assert!(person.mask.is_some());

    Ok(())
}

#[test]
fn test_warm_up_does_not_leak() -> TestResult {
    let model = Arc::new(ScriptedModel::new());
    let handle = ModelHandle::new(model.clone())?;
    assert_eq!(model.runs.load(Ordering::SeqCst), 1);
    assert_eq!(handle.output_shapes.len(), 2);
    assert_eq!(handle.output_shapes[0].as_slice(), &[1, 116, NUM_CANDIDATES]);

    let detections = run_detection(
        handle.model.as_ref(),
        &gray_frame(64, 64),
        &Labels::default(),
        &DetectParams::default(),
    )?;
    let labels: Vec<&str> = detections.iter().map(|d| d.label.as_str()).collect();
    assert_eq!(labels, vec!["person"]);

    Ok(())
}

#[test]
fn test_detect_draws_on_model_sized_canvas() -> TestResult {
    let store = ready_store()?;
    let session = store.session()?;
    assert_eq!(session.overlay.canvas_size(), (64, 64));

    let outcome = detect(
        &gray_frame(128, 64),
        session.model.model.as_ref(),
        store.labels(),
        store.params(),
        &session.overlay,
    )?;
    match outcome {
        DetectOutcome::Drawn { detections, frame } => {
            assert_eq!(detections.len(), 1);
            assert_eq!(frame.dimensions(), (64, 64));
        }
        DetectOutcome::Stale => panic!("single detection was discarded"),
    }

    Ok(())
}

#[tokio::test]
async fn test_healthcheck_and_status() -> TestResult {
    let app = app(ready_store()?);

    let res = app
        .clone()
        .oneshot(Request::builder().uri("/healthcheck").body(Body::empty())?)
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(&hyper::body::to_bytes(res.into_body()).await?[..], b"healthy");

    let res = app
        .oneshot(Request::builder().uri("/status").body(Body::empty())?)
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let status: serde_json::Value = serde_json::from_slice(&hyper::body::to_bytes(res.into_body()).await?)?;
    assert_eq!(status["model_name"], "scripted");
    assert_eq!(status["loading"]["is_loading"], false);
    assert_eq!(status["loading"]["progress"], 1.0);
    assert_eq!(status["canvas_size"], serde_json::json!([64, 64]));
    assert_eq!(status["shell"]["state"], "ready");
    assert_eq!(status["shell"]["activity"], "idle");

    Ok(())
}

#[tokio::test]
async fn test_detect_upload_as_json() -> TestResult {
    let store = ready_store()?;
    let (content_type, body) = multipart_upload(&gray_frame(128, 64))?;

    let res = app(store.clone())
        .oneshot(
            Request::post("/detect?format=json")
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))?,
        )
        .await?;
    assert_eq!(res.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_slice(&hyper::body::to_bytes(res.into_body()).await?)?;
    assert_eq!(json["width"], 128);
    assert_eq!(json["height"], 64);
    let detections = json["detections"].as_array().ok_or("no detections")?;
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0]["label"], "person");
    let mask = &detections[0]["mask"];
    let counts = mask["counts"].as_array().ok_or("no mask run lengths")?;
    let pixels: u64 = counts.iter().filter_map(|c| c.as_u64()).sum();
    assert_eq!(
        Some(pixels),
        mask["width"].as_u64().zip(mask["height"].as_u64()).map(|(w, h)| w * h)
    );

    // Back to idle once the request is answered
    assert_eq!(store.activity(), Activity::Idle);

    Ok(())
}

#[tokio::test]
async fn test_detect_upload_as_jpeg() -> TestResult {
    let (content_type, body) = multipart_upload(&gray_frame(64, 64))?;

    let res = app(ready_store()?)
        .oneshot(
            Request::post("/detect")
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))?,
        )
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "image/jpeg");

    let jpeg = hyper::body::to_bytes(res.into_body()).await?;
    let annotated = image::load_from_memory(&jpeg)?;
    assert_eq!((annotated.width(), annotated.height()), (64, 64));

    Ok(())
}

#[tokio::test]
async fn test_requests_before_ready() -> TestResult {
    let app = app(loading_store());
    let (content_type, body) = multipart_upload(&gray_frame(8, 8))?;

    let res = app
        .clone()
        .oneshot(
            Request::post("/detect")
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))?,
        )
        .await?;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let res = app
        .oneshot(Request::builder().uri("/seg_stream?name=cam").body(Body::empty())?)
        .await?;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    Ok(())
}

#[tokio::test]
async fn test_undecodable_upload_is_bad_request() -> TestResult {
    let boundary = "b";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"x.png\"\r\n\r\nnot an image\r\n--{boundary}--\r\n"
    );

    let res = app(ready_store()?)
        .oneshot(
            Request::post("/detect")
                .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
                .body(Body::from(body))?,
        )
        .await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn test_model_404_keeps_loading() -> TestResult {
    let addr = serve(Router::new())?;
    let store = loading_store();
    let loader = ModelLoader::new(ModelSource::resolve(&format!("http://{addr}"), "yolov8n-seg"));

    store.init(loader).await?;

    let loading = store.loading_state();
    assert!(loading.is_loading);
    let error = loading.error.ok_or("no error recorded")?;
    assert!(error.contains("404"), "unexpected error {error}");

    Ok(())
}

#[tokio::test]
async fn test_download_progress_reaches_one() -> TestResult {
    let payload = vec![7u8; 512 * 1024];
    let app = Router::new().route(
        "/yolov8n-seg_web_model/model.onnx",
        get(move || {
            let payload = payload.clone();
            async move { payload }
        }),
    );
    let addr = serve(app)?;

    let loader = ModelLoader::new(ModelSource::resolve(&format!("http://{addr}"), "yolov8n-seg"));
    let mut reports = Vec::new();
    let bytes = loader.fetch(&mut |p| reports.push(p)).await?;

    assert_eq!(bytes.len(), 512 * 1024);
    assert!(reports.windows(2).all(|w| w[0] <= w[1]), "{reports:?}");
    assert_eq!(reports.last(), Some(&1.0));

    // The payload is not a graph, so the full load fails after fetching
    let store = loading_store();
    store.init(loader).await?;
    let loading = store.loading_state();
    assert_eq!(loading.progress, 1.0);
    assert!(loading.is_loading);

    Ok(())
}

#[tokio::test]
async fn test_upload_while_other_client_streams() -> TestResult {
    let store = ready_store()?;
    let pubsub = Arc::new(NamedPubSub::new());
    let publisher = pubsub.publish("cam");
    let app = app_with(store.clone(), pubsub.clone());

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/seg_stream?name=cam&client=viewer")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let mut body = res.into_body();

    let (content_type, upload) = multipart_upload(&gray_frame(64, 64))?;
    let request = Request::post("/detect?format=json&client=page")
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(upload))?;
    let upload = tokio::spawn(app.oneshot(request));

    // Camera frames keep getting annotated while the upload is detected
    for seq in 1..=3 {
        publisher.send(camera_frame(seq)?);
        let part = timeout(Duration::from_secs(5), body.data())
            .await?
            .ok_or("stream ended early")??;
        assert!(part.starts_with(b"--frame\r\n"));
    }

    let res = upload.await??;
    assert_eq!(res.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&hyper::body::to_bytes(res.into_body()).await?)?;
    assert_eq!(json["detections"][0]["label"], "person");

    // The camera goes away, the stream ends and the shell returns to idle
    drop(publisher);
    let end = timeout(Duration::from_secs(5), body.data()).await?;
    assert!(end.is_none());
    assert_eq!(store.activity(), Activity::Idle);
    assert!(pubsub.channels().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_streams_need_a_publisher() -> TestResult {
    let pubsub = Arc::new(NamedPubSub::new());
    let app = app_with(ready_store()?, pubsub.clone());

    for uri in ["/stream?name=nobody", "/seg_stream?name=nobody"] {
        let res = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty())?)
            .await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND, "{uri}");
    }

    let _publisher = pubsub.publish("porch");
    let res = app
        .oneshot(Request::builder().uri("/channels").body(Body::empty())?)
        .await?;
    let names: Vec<String> = serde_json::from_slice(&hyper::body::to_bytes(res.into_body()).await?)?;
    assert_eq!(names, vec!["porch".to_string()]);

    Ok(())
}

#[tokio::test]
async fn test_unparsable_download_is_not_cached() -> TestResult {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/broken_web_model/model.onnx",
        get(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { "not a graph" }
        }),
    );
    let addr = serve(app)?;

    let cache_dir = std::env::temp_dir().join(format!("segcam-cache-{}", std::process::id()));
    let url = format!("http://{addr}");
    let loader = ModelLoader::new(ModelSource::resolve(&url, "broken")).with_cache_dir(Some(cache_dir.clone()));

    for attempt in 1..=2 {
        let res = loader.load(|_| {}).await;
        assert!(matches!(res, Err(SegError::ModelFormat(_))));
        // Downloaded again instead of reusing the bad artifact
        assert_eq!(hits.load(Ordering::SeqCst), attempt);
    }
    let cached = seg_server::fetch::cache_path(&cache_dir, &format!("{url}/broken_web_model/model.onnx"))?;
    assert!(!cached.exists());

    tokio::fs::remove_dir_all(&cache_dir).await.ok();
    Ok(())
}
