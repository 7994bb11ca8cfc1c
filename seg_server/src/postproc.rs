//! Postprocessing of raw YOLOv8 outputs into drawable detections.
//!
//! `output0` holds one row per candidate: `[cx, cy, w, h, class scores..., mask
//! coefficients...]`, either as `[1, features, candidates]` (the usual export)
//! or transposed. Segmentation models add `output1`, the prototype masks
//! `[1, nm, mh, mw]`; an instance mask is `sigmoid(coefficients · prototypes)`.
use image::{GrayImage, Luma};
use itertools::Itertools;
use ndarray::{s, Array2, Array3, ArrayD, ArrayView1, ArrayView2, ArrayView3, Axis, Ix3, Ix4};
use serde::{Serialize, Serializer};

use crate::{labels::Labels, nn::InputShape, pipeline::DetectParams, preproc::Letterbox, SegError};

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Axis-aligned box in frame pixels, top-left corner plus size.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn from_corners(corners: [f32; 4]) -> Self {
        Self {
            x: corners[0],
            y: corners[1],
            width: corners[2] - corners[0],
            height: corners[3] - corners[1],
        }
    }

    pub fn corners(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }
}

/// Instance mask cropped to its detection's box.
///
/// `probs` covers the frame pixels `x..x + probs.width()`, `y..y + probs.height()`
/// and stores the mask probability scaled to `0..=255`.
#[derive(Clone, Debug)]
pub struct Mask {
    pub x: u32,
    pub y: u32,
    pub probs: GrayImage,
    threshold: u8,
}

impl Mask {
    pub fn new(x: u32, y: u32, probs: GrayImage, threshold: f32) -> Self {
        Self {
            x,
            y,
            probs,
            threshold: (threshold.clamp(0.0, 1.0) * 255.0).round() as u8,
        }
    }

    /// Whether the frame pixel `(x, y)` belongs to the object.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        if x < self.x || y < self.y {
            return false;
        }
        let (x, y) = (x - self.x, y - self.y);
        if x >= self.probs.width() || y >= self.probs.height() {
            return false;
        }
        self.probs.get_pixel(x, y)[0] > self.threshold
    }

    /// Number of pixels belonging to the object.
    pub fn area(&self) -> usize {
        self.probs.pixels().filter(|p| p[0] > self.threshold).count()
    }

    /// Run lengths of the thresholded mask in row-major order.
    ///
    /// Runs alternate between background and object and always start with
    /// background, so the first count is zero when the first pixel is set.
    pub fn run_lengths(&self) -> Vec<u32> {
        let mut counts = Vec::new();
        let mut current = false;
        let mut run = 0;
        for pixel in self.probs.pixels() {
            let inside = pixel[0] > self.threshold;
            if inside != current {
                counts.push(run);
                current = inside;
                run = 0;
            }
            run += 1;
        }
        counts.push(run);
        counts
    }
}

/// Mask as sent to clients: its placement in the frame and run lengths.
#[derive(Serialize)]
struct MaskRle {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    counts: Vec<u32>,
}

impl Serialize for Mask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        MaskRle {
            x: self.x,
            y: self.y,
            width: self.probs.width(),
            height: self.probs.height(),
            counts: self.run_lengths(),
        }
        .serialize(serializer)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: usize,
    pub label: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<Mask>,
}

struct Candidate {
    /// `[x1, y1, x2, y2]` in model input coordinates
    corners: [f32; 4],
    class_id: usize,
    score: f32,
    row: usize,
}

/// Turn raw network outputs into thresholded, suppressed detections in frame
/// coordinates.
pub fn postprocess(
    outputs: &[ArrayD<f32>],
    letterbox: &Letterbox,
    input: &InputShape,
    labels: &Labels,
    params: &DetectParams,
) -> Result<Vec<Detection>, SegError> {
    let raw_boxes = outputs
        .first()
        .ok_or_else(|| SegError::ModelFormat("model produced no outputs".into()))?;
    let protos = prototypes(outputs)?;
    let num_masks = protos.as_ref().map_or(0, |p| p.shape()[0]);

    let preds = candidates_view(raw_boxes, num_masks)?;
    let num_classes = preds.ncols() - 4 - num_masks;

    let candidates: Vec<Candidate> = preds
        .outer_iter()
        .enumerate()
        .filter_map(|(row, pred)| {
            let (class_id, score) = pred
                .slice(s![4..4 + num_classes])
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            match score {
                x if x >= params.class_threshold => {
                    let (cx, cy, w, h) = (pred[0], pred[1], pred[2], pred[3]);
                    Some(Candidate {
                        corners: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
                        class_id,
                        score,
                        row,
                    })
                }
                _ => None,
            }
        })
        .sorted_by(|a, b| a.score.total_cmp(&b.score))
        .collect();

    let selected = non_maximum_suppression(candidates, params.iou_threshold, params.max_detections);

    log::debug!("{} detections after suppression", selected.len());

    Ok(selected
        .into_iter()
        .filter_map(|candidate| {
            let bbox = to_frame_bbox(&candidate.corners, letterbox)?;
            let mask = protos.as_ref().map(|protos| {
                let coefs = preds.slice(s![candidate.row, 4 + num_classes..]);
                decode_mask(coefs, protos.view(), &bbox, letterbox, input, params.mask_threshold)
            });
            Some(Detection {
                bbox,
                class_id: candidate.class_id,
                label: labels.name(candidate.class_id),
                score: candidate.score,
                mask,
            })
        })
        .collect())
}

/// Prototype masks `[nm, mh, mw]` of a segmentation model, if present.
fn prototypes(outputs: &[ArrayD<f32>]) -> Result<Option<Array3<f32>>, SegError> {
    let Some(raw) = outputs.get(1) else {
        return Ok(None);
    };
    let protos = raw
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| SegError::ModelFormat(format!("unexpected prototype shape {:?}", raw.shape())))?;
    Ok(Some(protos.index_axis(Axis(0), 0).to_owned()))
}

/// View `output0` as `[candidates, features]`.
fn candidates_view(raw: &ArrayD<f32>, num_masks: usize) -> Result<ArrayView2<'_, f32>, SegError> {
    let raw3 = raw
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| SegError::ModelFormat(format!("expected 3D detections, got {:?}", raw.shape())))?;
    let batch: ArrayView2<'_, f32> = raw3.index_axis_move(Axis(0), 0);

    // There are always far more candidates than features per candidate
    let preds = match batch.nrows() < batch.ncols() {
        true => batch.reversed_axes(),
        false => batch,
    };

    if preds.ncols() <= 4 + num_masks {
        return Err(SegError::ModelFormat(format!(
            "{} features per candidate leave no class scores",
            preds.ncols()
        )));
    }

    Ok(preds)
}

/// Run non-maximum-suppression on candidates sorted by ascending score.
///
/// Starting with the most confident candidate, grow the selection with every
/// candidate whose IoU with all selected boxes stays at or below `max_iou`.
/// Suppression is class-agnostic.
fn non_maximum_suppression(
    mut sorted_candidates: Vec<Candidate>,
    max_iou: f32,
    max_selected: usize,
) -> Vec<Candidate> {
    let mut selected: Vec<Candidate> = vec![];
    'candidates: while selected.len() < max_selected {
        // Get next most confident candidate from the back of the ascending-sorted vector
        match sorted_candidates.pop() {
            Some(candidate) => {
                for chosen in selected.iter() {
                    if iou(&candidate.corners, &chosen.corners) > max_iou {
                        continue 'candidates;
                    }
                }
                selected.push(candidate);
            }
            None => break 'candidates,
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two `[x1, y1, x2, y2]` boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // Non-overlapping boxes give an ill-defined overlap box with zero area
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Area of a `[x1, y1, x2, y2]` box, zero if the corners are swapped.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}

/// Map input-space corners to a frame box, clamped to the frame.
fn to_frame_bbox(corners: &[f32; 4], letterbox: &Letterbox) -> Option<BBox> {
    let (fw, fh) = (letterbox.frame_width as f32, letterbox.frame_height as f32);
    let (x1, y1) = letterbox.to_frame(corners[0], corners[1]);
    let (x2, y2) = letterbox.to_frame(corners[2], corners[3]);
    let (x1, y1) = (x1.clamp(0.0, fw), y1.clamp(0.0, fh));
    let (x2, y2) = (x2.clamp(0.0, fw), y2.clamp(0.0, fh));

    if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
        return None;
    }
    Some(BBox::from_corners([x1, y1, x2, y2]))
}

/// Decode one instance mask at frame resolution inside `bbox`.
fn decode_mask(
    coefs: ArrayView1<f32>,
    protos: ArrayView3<f32>,
    bbox: &BBox,
    letterbox: &Letterbox,
    input: &InputShape,
    threshold: f32,
) -> Mask {
    let (mask_h, mask_w) = (protos.shape()[1], protos.shape()[2]);
    let proto_x = mask_w as f32 / input.width as f32;
    let proto_y = mask_h as f32 / input.height as f32;

    let x0 = bbox.x.floor() as u32;
    let y0 = bbox.y.floor() as u32;
    let x1 = ((bbox.x + bbox.width).ceil() as u32).min(letterbox.frame_width);
    let y1 = ((bbox.y + bbox.height).ceil() as u32).min(letterbox.frame_height);

    // Continuous prototype coordinates of a frame pixel centre
    let to_proto = |x: u32, y: u32| {
        let (ix, iy) = letterbox.to_input(x as f32 + 0.5, y as f32 + 0.5);
        (ix * proto_x - 0.5, iy * proto_y - 0.5)
    };

    // Only the prototype cells under the box are combined
    let (px_min, py_min) = to_proto(x0, y0);
    let (px_max, py_max) = to_proto(x1.saturating_sub(1), y1.saturating_sub(1));
    let col0 = (px_min.floor().max(0.0) as usize).min(mask_w - 1);
    let row0 = (py_min.floor().max(0.0) as usize).min(mask_h - 1);
    let col1 = (px_max.ceil().max(0.0) as usize + 1).min(mask_w - 1);
    let row1 = (py_max.ceil().max(0.0) as usize + 1).min(mask_h - 1);

    let mut logits = Array2::<f32>::zeros((row1 - row0 + 1, col1 - col0 + 1));
    for ((r, c), logit) in logits.indexed_iter_mut() {
        *logit = coefs
            .iter()
            .zip(protos.slice(s![.., row0 + r, col0 + c]).iter())
            .map(|(coef, proto)| coef * proto)
            .sum();
    }

    let sample = |px: f32, py: f32| -> f32 {
        let px = (px - col0 as f32).clamp(0.0, (logits.ncols() - 1) as f32);
        let py = (py - row0 as f32).clamp(0.0, (logits.nrows() - 1) as f32);
        let (c0, r0) = (px.floor() as usize, py.floor() as usize);
        let (c1, r1) = ((c0 + 1).min(logits.ncols() - 1), (r0 + 1).min(logits.nrows() - 1));
        let (fx, fy) = (px - c0 as f32, py - r0 as f32);
        let top = logits[[r0, c0]] * (1.0 - fx) + logits[[r0, c1]] * fx;
        let bottom = logits[[r1, c0]] * (1.0 - fx) + logits[[r1, c1]] * fx;
        top * (1.0 - fy) + bottom * fy
    };

    let probs = GrayImage::from_fn(x1 - x0, y1 - y0, |x, y| {
        let (px, py) = to_proto(x0 + x, y0 + y);
        Luma([(sigmoid(sample(px, py)) * 255.0).round() as u8])
    });

    Mask::new(x0, y0, probs, threshold)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
