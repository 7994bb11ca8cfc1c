//! Detection pipeline: letterbox, infer, postprocess, draw.
//!
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use image::RgbImage;

use crate::{
    labels::Labels,
    nn::InferModel,
    postproc::{postprocess, Detection},
    preproc::preprocess,
    render::{Canvas, Renderer},
    SegError,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectParams {
    pub class_threshold: f32,
    pub iou_threshold: f32,
    pub mask_threshold: f32,
    pub max_detections: usize,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            class_threshold: 0.2,
            iou_threshold: 0.45,
            mask_threshold: 0.5,
            max_detections: 100,
        }
    }
}

/// Run the network on one frame and return its detections in frame coordinates.
///
/// The input tensor is moved into the engine and the raw outputs are dropped
/// when this returns, on success and on error alike.
pub fn run_detection(
    model: &dyn InferModel,
    frame: &RgbImage,
    labels: &Labels,
    params: &DetectParams,
) -> Result<Vec<Detection>, SegError> {
    let input_shape = model.input_shape();
    let (input, letterbox) = preprocess(frame, &input_shape)?;
    let raw_nn_out = model.run(input)?;
    postprocess(&raw_nn_out, &letterbox, &input_shape, labels, params)
}

/// Ticket taken before a detection starts, ordering it against all others.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Ticket(u64);

/// Generation counter guarding the canvas.
///
/// A finished detection may draw only if no detection that started later has
/// drawn already, so a slow, stale result never replaces a newer one.
#[derive(Default)]
pub struct DrawGate {
    issued: AtomicU64,
}

impl DrawGate {
    pub fn issue(&self) -> Ticket {
        Ticket(self.issued.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Whether a detection started after `ticket`.
    pub fn is_superseded(&self, ticket: Ticket) -> bool {
        self.issued.load(Ordering::SeqCst) > ticket.0
    }
}

struct CanvasState {
    canvas: Canvas,
    last_drawn: Option<Ticket>,
}

/// Canvas of one consumer together with its gate and renderer.
pub struct Overlay {
    gate: DrawGate,
    state: Mutex<CanvasState>,
    renderer: Renderer,
}

#[derive(Debug)]
pub enum DetectOutcome {
    /// Detections were drawn; `frame` is the annotated canvas composited over the frame.
    Drawn {
        detections: Vec<Detection>,
        frame: RgbImage,
    },
    /// A newer detection drew first, the result was discarded.
    Stale,
}

impl Overlay {
    pub fn new(canvas: Canvas, renderer: Renderer) -> Self {
        Self {
            gate: DrawGate::default(),
            state: Mutex::new(CanvasState {
                canvas,
                last_drawn: None,
            }),
            renderer,
        }
    }

    pub fn ticket(&self) -> Ticket {
        self.gate.issue()
    }

    pub fn is_superseded(&self, ticket: Ticket) -> bool {
        self.gate.is_superseded(ticket)
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        let state = self.lock();
        (state.canvas.width(), state.canvas.height())
    }

    /// Draw the detections of `frame` unless a newer ticket already drew.
    pub fn draw(&self, ticket: Ticket, frame: &RgbImage, detections: Vec<Detection>) -> DetectOutcome {
        let mut state = self.lock();
        if state.last_drawn.map_or(false, |last| last > ticket) {
            log::debug!("Discarding stale detection {:?}", ticket);
            return DetectOutcome::Stale;
        }

        self.renderer
            .render(&mut state.canvas, &detections, frame.dimensions());
        state.last_drawn = Some(ticket);
        let frame = state.canvas.composite(frame);

        DetectOutcome::Drawn { detections, frame }
    }

    /// Erase the canvas.
    pub fn clear(&self) {
        self.lock().canvas.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_blank(&self) -> bool {
        self.lock().canvas.overlay().pixels().all(|p| p[3] == 0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CanvasState> {
        // A panic while drawing leaves at worst a half-drawn overlay
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Detect objects in `frame` and draw them onto the overlay.
pub fn detect(
    frame: &RgbImage,
    model: &dyn InferModel,
    labels: &Labels,
    params: &DetectParams,
    overlay: &Overlay,
) -> Result<DetectOutcome, SegError> {
    let ticket = overlay.ticket();
    let detections = run_detection(model, frame, labels, params)?;
    Ok(overlay.draw(ticket, frame, detections))
}
