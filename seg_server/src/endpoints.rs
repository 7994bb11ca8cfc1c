//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use axum::{
    body::StreamBody,
    extract::{Multipart, Query},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    pipeline::{detect, DetectOutcome},
    postproc::Detection,
    pubsub::NamedPubSub,
    shell::{ShellStore, Status},
    streamer::{annotated_stream, encode_jpeg, raw_stream, MJPEG_CONTENT_TYPE},
    SegError,
};

/// Settings of the HTTP surface that are not part of the detection.
#[derive(Clone, Copy, Debug)]
pub struct HttpSettings {
    pub jpeg_quality: i32,
}

/// Search parameters available to streams.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    name: Option<String>,
    /// Page instance the stream is shown in.
    #[serde(default)]
    client: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DetectQuery {
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    client: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub width: u32,
    pub height: u32,
    pub detections: Vec<Detection>,
}

impl IntoResponse for SegError {
    fn into_response(self) -> Response {
        let status = match &self {
            SegError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            SegError::UnsupportedInput(_) => StatusCode::BAD_REQUEST,
            SegError::ShapeMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SegError::UnknownChannel(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("Request failed: {self}");
        }
        (status, self.to_string()).into_response()
    }
}

pub fn router(store: Arc<ShellStore>, pubsub: Arc<NamedPubSub>, settings: HttpSettings) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/status", get(status))
        .route("/channels", get(channels))
        .route("/detect", post(detect_image))
        .route("/stream", get(named_stream))
        .route("/seg_stream", get(seg_stream))
        .layer(Extension(store))
        .layer(Extension(pubsub))
        .layer(Extension(settings))
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

pub async fn index(Extension(store): Extension<Arc<ShellStore>>) -> Html<String> {
    Html(INDEX_HTML.replace("{{model_name}}", store.model_name()))
}

pub async fn status(Extension(store): Extension<Arc<ShellStore>>) -> Json<Status> {
    Json(store.status())
}

/// Camera channels that currently have a publisher.
pub async fn channels(Extension(pubsub): Extension<Arc<NamedPubSub>>) -> Json<Vec<String>> {
    Json(pubsub.channels())
}

/// Detect objects in an uploaded image.
///
/// Answers with the annotated canvas as JPEG, or with the detections as JSON
/// for `?format=json`. With `?client=` the image is drawn on that client's
/// canvas, and a newer detection of the same client turns this one into a
/// `409 Conflict`.
pub async fn detect_image(
    Extension(store): Extension<Arc<ShellStore>>,
    Extension(settings): Extension<HttpSettings>,
    Query(params): Query<DetectQuery>,
    mut multipart: Multipart,
) -> Result<Response, SegError> {
    let (_guard, session) = store.begin_image(params.client.as_deref())?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| SegError::UnsupportedInput(e.to_string()))?
    {
        let data = field
            .bytes()
            .await
            .map_err(|e| SegError::UnsupportedInput(e.to_string()))?;
        if !data.is_empty() {
            upload = Some(data);
            break;
        }
    }
    let upload = upload.ok_or_else(|| SegError::UnsupportedInput("no image in upload".into()))?;
    log::info!("Detecting on uploaded image of {} bytes", upload.len());

    let detect_store = store.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let frame = image::load_from_memory(&upload)
            .map_err(|e| SegError::UnsupportedInput(format!("cannot decode image: {e}")))?
            .to_rgb8();
        let outcome = detect(
            &frame,
            session.model.model.as_ref(),
            detect_store.labels(),
            detect_store.params(),
            &session.overlay,
        )?;
        Ok::<_, SegError>((frame.dimensions(), outcome))
    })
    .await
    .map_err(|e| SegError::Inference(e.into()))??;

    let ((width, height), outcome) = outcome;
    let (detections, annotated) = match outcome {
        DetectOutcome::Drawn { detections, frame } => (detections, frame),
        DetectOutcome::Stale => {
            return Ok((StatusCode::CONFLICT, "superseded by a newer detection").into_response());
        }
    };

    if params.format.as_deref() == Some("json") {
        return Ok(Json(DetectResponse {
            width,
            height,
            detections,
        })
        .into_response());
    }

    let jpeg = encode_jpeg(&annotated, settings.jpeg_quality)?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}

// Endpoint of received image streams.
pub async fn named_stream(
    Extension(pubsub): Extension<Arc<NamedPubSub>>,
    Query(params): Query<StreamParams>,
) -> Result<impl IntoResponse, SegError> {
    let name = params.name.unwrap_or_else(|| "unknown".into());
    log::info!("Stream for {} requested", &name);

    let rx = pubsub
        .get_broadcast_receiver(&name)
        .ok_or(SegError::UnknownChannel(name))?;

    // Set body and headers for multipart streaming
    let body = StreamBody::new(raw_stream(rx));
    let headers = [(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)];

    Ok((headers, body))
}

pub async fn seg_stream(
    Extension(store): Extension<Arc<ShellStore>>,
    Extension(pubsub): Extension<Arc<NamedPubSub>>,
    Extension(settings): Extension<HttpSettings>,
    Query(params): Query<StreamParams>,
) -> Result<impl IntoResponse, SegError> {
    let name = params.name.unwrap_or_else(|| "unknown".into());
    let (guard, session) = store.begin_stream(params.client.as_deref())?;
    log::info!("Segmented stream for {} requested", &name);

    let rx = pubsub
        .get_broadcast_receiver(&name)
        .ok_or(SegError::UnknownChannel(name))?;

    let stream = annotated_stream(store.clone(), guard, session, rx, settings.jpeg_quality);

    let body = StreamBody::new(stream);
    let headers = [(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)];

    Ok((headers, body))
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>segcam</title>
  <style>
    body { font-family: sans-serif; margin: 2em; }
    #progress { width: 320px; }
    #error { color: #c00; }
    #output { max-width: 100%; border: 1px solid #ccc; }
    .hidden { display: none; }
  </style>
</head>
<body>
  <h1>segcam</h1>
  <p>Serving <code>{{model_name}}</code></p>

  <div id="loader">
    <p>Loading model <span id="percent">0.00%</span></p>
    <progress id="progress" max="1" value="0"></progress>
    <p id="error"></p>
  </div>

  <div id="controls" class="hidden">
    <p>
      <input type="file" id="image" accept="image/*">
    </p>
    <p>
      <input type="text" id="channel" value="unknown" list="channels">
      <datalist id="channels"></datalist>
      <button id="camera">Start camera</button>
    </p>
  </div>

  <img id="output" alt="">

<script>
const output = document.getElementById("output");
const camera = document.getElementById("camera");
const client = Math.random().toString(36).slice(2);
let streaming = false;

async function listChannels() {
  const res = await fetch("/channels");
  const names = await res.json();
  const list = document.getElementById("channels");
  list.innerHTML = "";
  for (const name of names) {
    const option = document.createElement("option");
    option.value = name;
    list.appendChild(option);
  }
}

async function poll() {
  const res = await fetch("/status");
  const status = await res.json();
  const loading = status.loading;
  document.getElementById("progress").value = loading.progress;
  document.getElementById("percent").textContent = (loading.progress * 100).toFixed(2) + "%";
  document.getElementById("error").textContent = loading.error || "";
  if (loading.is_loading) {
    setTimeout(poll, 500);
    return;
  }
  document.getElementById("loader").classList.add("hidden");
  document.getElementById("controls").classList.remove("hidden");
  listChannels();
}

function stopCamera() {
  streaming = false;
  output.src = "";
  camera.textContent = "Start camera";
}

document.getElementById("image").addEventListener("change", async (event) => {
  const file = event.target.files[0];
  if (!file) {
    return;
  }
  stopCamera();
  const form = new FormData();
  form.append("image", file);
  const res = await fetch("/detect?client=" + client, { method: "POST", body: form });
  if (!res.ok) {
    alert(await res.text());
    return;
  }
  output.src = URL.createObjectURL(await res.blob());
});

camera.addEventListener("click", () => {
  if (streaming) {
    stopCamera();
    return;
  }
  const channel = encodeURIComponent(document.getElementById("channel").value);
  output.src = "/seg_stream?client=" + client + "&name=" + channel;
  camera.textContent = "Stop camera";
  streaming = true;
});

poll();
</script>
</body>
</html>
"#;
