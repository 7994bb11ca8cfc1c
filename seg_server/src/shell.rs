//! Application state of the server.
//!
//! [`ShellStore`] owns the loading state and the model once it is ready.
//! Handlers borrow a [`Session`] from it and mark what they are doing with an
//! [`ActivityGuard`]. Every consumer draws on its own canvas overlay, created
//! at the model's input size. Requests that carry the same client id share
//! one overlay, so a newer detection of that client supersedes an older one.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, RwLock, Weak,
    },
};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    config::ServerConfig,
    labels::Labels,
    loader::ModelLoader,
    nn::{InputShape, ModelHandle},
    pipeline::{DetectParams, Overlay},
    render::{Canvas, Renderer},
    SegError,
};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoadingState {
    pub is_loading: bool,
    pub progress: f32,
    pub error: Option<String>,
}

impl Default for LoadingState {
    fn default() -> Self {
        Self {
            is_loading: true,
            progress: 0.0,
            error: None,
        }
    }
}

impl LoadingState {
    /// Move progress forward. Progress never goes back and stays within `[0, 1]`.
    fn advance(&mut self, progress: f32) {
        if progress.is_nan() {
            return;
        }
        self.progress = self.progress.max(progress.clamp(0.0, 1.0));
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Idle,
    ImageDetecting,
    VideoStreaming,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ShellState {
    Loading { progress: f32 },
    Ready { activity: Activity },
    LoadFailed { progress: f32, reason: String },
}

/// Everything a detection needs once the model is loaded.
#[derive(Clone)]
pub struct Session {
    pub model: ModelHandle,
    pub overlay: Arc<Overlay>,
}

/// Snapshot served on `/status`.
#[derive(Debug, Serialize)]
pub struct Status {
    pub model_name: String,
    pub loading: LoadingState,
    pub shell: ShellState,
    pub canvas_size: Option<(u32, u32)>,
    pub input_shape: Option<InputShape>,
    pub output_shapes: Vec<Vec<usize>>,
    pub labels_enabled: bool,
}

pub struct ShellStore {
    model_name: String,
    labels: Labels,
    params: DetectParams,
    renderer: Renderer,
    loading: Mutex<LoadingState>,
    model: RwLock<Option<ModelHandle>>,
    overlays: Mutex<HashMap<String, Weak<Overlay>>>,
    images: AtomicUsize,
    streams: AtomicUsize,
}

impl ShellStore {
    pub fn new(model_name: impl Into<String>, labels: Labels, params: DetectParams, renderer: Renderer) -> Self {
        Self {
            model_name: model_name.into(),
            labels,
            params,
            renderer,
            loading: Mutex::new(LoadingState::default()),
            model: RwLock::new(None),
            overlays: Mutex::new(HashMap::new()),
            images: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, SegError> {
        let labels = match config.labels.as_deref() {
            Some(path) => Labels::from_json_file(path)?,
            None => Labels::default(),
        };
        let renderer = Renderer::with_font_file(config.font.as_deref());

        Ok(Self::new(
            config.model_name.clone(),
            labels,
            config.detect_params(),
            renderer,
        ))
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn params(&self) -> &DetectParams {
        &self.params
    }

    /// Spawn the model load. Progress and the outcome are reported into the store.
    pub fn init(self: &Arc<Self>, loader: ModelLoader) -> JoinHandle<()> {
        let store = self.clone();
        log::info!("Loading {} from {}", self.model_name, loader.source().location());
        tokio::spawn(async move {
            let progress_store = store.clone();
            match loader.load(move |p| progress_store.report_progress(p)).await {
                Ok(model) => store.set_ready(model),
                Err(e) => {
                    log::error!("Could not load model {}: {}", store.model_name, e);
                    store.set_failed(&e);
                }
            }
        })
    }

    pub fn report_progress(&self, progress: f32) {
        let mut loading = self.lock_loading();
        if loading.is_loading {
            loading.advance(progress);
        }
    }

    /// Publish the loaded model. Canvases are created at its input size.
    pub fn set_ready(&self, model: ModelHandle) {
        let (width, height) = canvas_size(&model.input_shape);
        log::info!("Model {} ready, canvas {}x{}", self.model_name, width, height);

        *self.write_model() = Some(model);

        let mut loading = self.lock_loading();
        loading.advance(1.0);
        loading.is_loading = false;
        loading.error = None;
    }

    /// Record a failed load. The store stays in the loading state.
    pub fn set_failed(&self, err: &SegError) {
        self.lock_loading().error = Some(err.to_string());
    }

    pub fn loading_state(&self) -> LoadingState {
        self.lock_loading().clone()
    }

    pub fn activity(&self) -> Activity {
        if self.streams.load(Ordering::SeqCst) > 0 {
            Activity::VideoStreaming
        } else if self.images.load(Ordering::SeqCst) > 0 {
            Activity::ImageDetecting
        } else {
            Activity::Idle
        }
    }

    pub fn state(&self) -> ShellState {
        if self.read_model().is_some() {
            return ShellState::Ready {
                activity: self.activity(),
            };
        }

        let loading = self.loading_state();
        match loading.error {
            Some(reason) => ShellState::LoadFailed {
                progress: loading.progress,
                reason,
            },
            None => ShellState::Loading {
                progress: loading.progress,
            },
        }
    }

    /// Session with a fresh overlay that no other consumer draws on.
    pub fn session(&self) -> Result<Session, SegError> {
        self.session_for(None)
    }

    /// Session drawing on the overlay of `client`.
    ///
    /// The overlay lives as long as a session of that client holds it.
    pub fn session_for(&self, client: Option<&str>) -> Result<Session, SegError> {
        let model = self.read_model().clone().ok_or(SegError::NotReady)?;
        let new_overlay = || {
            let (width, height) = canvas_size(&model.input_shape);
            Arc::new(Overlay::new(Canvas::new(width, height), self.renderer.clone()))
        };

        let overlay = match client {
            None => new_overlay(),
            Some(client) => {
                let mut overlays = self.lock_overlays();
                match overlays.get(client).and_then(Weak::upgrade) {
                    Some(overlay) => overlay,
                    None => {
                        overlays.retain(|_, overlay| overlay.strong_count() > 0);
                        let overlay = new_overlay();
                        overlays.insert(client.to_owned(), Arc::downgrade(&overlay));
                        overlay
                    }
                }
            }
        };

        Ok(Session { model, overlay })
    }

    /// Enter `ImageDetecting` for the lifetime of the returned guard.
    pub fn begin_image(self: &Arc<Self>, client: Option<&str>) -> Result<(ActivityGuard, Session), SegError> {
        self.begin(ActivityKind::Image, client)
    }

    /// Enter `VideoStreaming` for the lifetime of the returned guard.
    pub fn begin_stream(self: &Arc<Self>, client: Option<&str>) -> Result<(ActivityGuard, Session), SegError> {
        self.begin(ActivityKind::Stream, client)
    }

    fn begin(
        self: &Arc<Self>,
        kind: ActivityKind,
        client: Option<&str>,
    ) -> Result<(ActivityGuard, Session), SegError> {
        let session = self.session_for(client)?;
        self.counter(kind).fetch_add(1, Ordering::SeqCst);
        let guard = ActivityGuard {
            store: self.clone(),
            kind,
        };
        Ok((guard, session))
    }

    /// Release the model and erase the canvases still in use.
    pub fn teardown(&self) {
        for (_, overlay) in self.lock_overlays().drain() {
            if let Some(overlay) = overlay.upgrade() {
                overlay.clear();
            }
        }
        if self.write_model().take().is_some() {
            log::info!("Released model {}", self.model_name);
        }
    }

    pub fn status(&self) -> Status {
        let model = self.read_model().clone();
        Status {
            model_name: self.model_name.clone(),
            loading: self.loading_state(),
            shell: self.state(),
            canvas_size: model.as_ref().map(|m| canvas_size(&m.input_shape)),
            input_shape: model.as_ref().map(|m| m.input_shape),
            output_shapes: model
                .map(|m| m.output_shapes.iter().map(|shape| shape.to_vec()).collect())
                .unwrap_or_default(),
            labels_enabled: self.renderer.has_font(),
        }
    }

    fn counter(&self, kind: ActivityKind) -> &AtomicUsize {
        match kind {
            ActivityKind::Image => &self.images,
            ActivityKind::Stream => &self.streams,
        }
    }

    fn lock_loading(&self) -> MutexGuard<'_, LoadingState> {
        self.loading.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_overlays(&self) -> MutexGuard<'_, HashMap<String, Weak<Overlay>>> {
        self.overlays.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_model(&self) -> std::sync::RwLockReadGuard<'_, Option<ModelHandle>> {
        self.model.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_model(&self) -> std::sync::RwLockWriteGuard<'_, Option<ModelHandle>> {
        self.model.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn canvas_size(input: &InputShape) -> (u32, u32) {
    (input.width as u32, input.height as u32)
}

#[derive(Clone, Copy, Debug)]
enum ActivityKind {
    Image,
    Stream,
}

/// Marks an ongoing image detection or stream. Dropping it ends the activity.
pub struct ActivityGuard {
    store: Arc<ShellStore>,
    kind: ActivityKind,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.store.counter(self.kind).fetch_sub(1, Ordering::SeqCst);
    }
}
