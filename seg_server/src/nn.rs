//! Inference engine boundary.
//!
//! The server only talks to the network through [`InferModel`]. [`TractModel`]
//! implements it on top of `tract-onnx`; tests plug in scripted models.
use std::{io::Cursor, sync::Arc};

use ndarray::{Array4, ArrayD};
use serde::Serialize;
use smallvec::SmallVec;
use tract_onnx::prelude::*;

use crate::SegError;

type NnModel = TypedRunnableModel<TypedModel>;

/// Shape of a single output tensor.
pub type OutputShape = SmallVec<[usize; 4]>;

/// Memory layout of the image input tensor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Layout {
    /// `[batch, channels, height, width]`, the usual ONNX export.
    Nchw,
    /// `[batch, height, width, channels]`
    Nhwc,
}

/// Input tensor shape of an image model.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct InputShape {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub layout: Layout,
}

impl InputShape {
    /// Interpret a 4D tensor shape. Channels are expected to be 3 (RGB).
    pub fn from_dims(dims: &[usize]) -> Result<Self, SegError> {
        match *dims {
            [batch, 3, height, width] => Ok(Self {
                batch,
                height,
                width,
                channels: 3,
                layout: Layout::Nchw,
            }),
            [batch, height, width, 3] => Ok(Self {
                batch,
                height,
                width,
                channels: 3,
                layout: Layout::Nhwc,
            }),
            _ => Err(SegError::ModelFormat(format!(
                "expected a 4D RGB image input, got {dims:?}"
            ))),
        }
    }

    /// Single RGB image of the given size.
    pub fn pinned(width: usize, height: usize, layout: Layout) -> Self {
        Self {
            batch: 1,
            height,
            width,
            channels: 3,
            layout,
        }
    }

    /// Tensor dimensions in the model's layout.
    pub fn dims(&self) -> [usize; 4] {
        match self.layout {
            Layout::Nchw => [self.batch, self.channels, self.height, self.width],
            Layout::Nhwc => [self.batch, self.height, self.width, self.channels],
        }
    }

    pub fn zeros(&self) -> Array4<f32> {
        Array4::zeros(self.dims())
    }
}

pub trait InferModel: Send + Sync {
    fn input_shape(&self) -> InputShape;

    /// Run one forward pass. The input is consumed, outputs are owned by the caller.
    fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>, SegError>;
}

/// ONNX graph optimized and made runnable by tract.
pub struct TractModel {
    model: NnModel,
    input_shape: InputShape,
}

impl TractModel {
    /// Parse and optimize an ONNX graph.
    ///
    /// `pinned` fixes the input shape, in its own layout, for graphs with
    /// dynamic input dimensions.
    pub fn from_bytes(bytes: &[u8], pinned: Option<InputShape>) -> Result<Self, SegError> {
        let mut model = tract_onnx::onnx()
            .model_for_read(&mut Cursor::new(bytes))
            .map_err(format_err)?;

        if let Some(pinned) = pinned {
            let [d0, d1, d2, d3] = pinned.dims();
            let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(d0, d1, d2, d3));
            model = model.with_input_fact(0, input_fact).map_err(format_err)?;
        }

        let model = model.into_optimized().map_err(format_err)?;
        let dims = model
            .input_fact(0)
            .map_err(format_err)?
            .shape
            .as_concrete()
            .map(|dims| dims.to_vec())
            .ok_or_else(|| {
                SegError::ModelFormat("model input has dynamic dimensions, set --input-size".into())
            })?;
        let input_shape = InputShape::from_dims(&dims)?;
        let model = model.into_runnable().map_err(format_err)?;

        Ok(Self { model, input_shape })
    }
}

impl InferModel for TractModel {
    fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>, SegError> {
        check_input(&self.input_shape, &input)?;
        let input: Tensor = input.into();
        let raw_nn_out = self.model.run(tvec!(input.into())).map_err(SegError::Inference)?;

        raw_nn_out
            .iter()
            .map(|output| {
                output
                    .to_array_view::<f32>()
                    .map(|view| view.to_owned())
                    .map_err(SegError::Inference)
            })
            .collect()
    }
}

/// Reject tensors that do not have the model's input shape.
pub fn check_input(expected: &InputShape, input: &Array4<f32>) -> Result<(), SegError> {
    let expected = expected.dims();
    if input.shape() != expected.as_slice() {
        return Err(SegError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: input.shape().to_vec(),
        });
    }
    Ok(())
}

fn format_err(err: anyhow::Error) -> SegError {
    SegError::ModelFormat(format!("{err:#}"))
}

/// A loaded and warmed-up model together with its tensor shapes.
#[derive(Clone)]
pub struct ModelHandle {
    pub model: Arc<dyn InferModel>,
    pub input_shape: InputShape,
    pub output_shapes: Vec<OutputShape>,
}

impl ModelHandle {
    /// Warm the model up and record its output shapes.
    pub fn new(model: Arc<dyn InferModel>) -> Result<Self, SegError> {
        let input_shape = model.input_shape();
        let output_shapes = warm_up(model.as_ref())?;
        log::info!(
            "Model ready: input {:?} ({:?}), outputs {:?}",
            input_shape.dims(),
            input_shape.layout,
            output_shapes
        );

        Ok(Self {
            model,
            input_shape,
            output_shapes,
        })
    }
}

/// Run a throwaway pass on a zero-valued input so lazy initialisation in the
/// engine happens before the first real frame. Only the output shapes survive.
pub fn warm_up(model: &dyn InferModel) -> Result<Vec<OutputShape>, SegError> {
    let dummy_input = model.input_shape().zeros();
    let warmup_results = model.run(dummy_input)?;

    Ok(warmup_results
        .iter()
        .map(|output| output.shape().iter().copied().collect())
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_input_shape_layouts() -> Result<(), SegError> {
        let nchw = InputShape::from_dims(&[1, 3, 480, 640])?;
        assert_eq!((nchw.width, nchw.height, nchw.layout), (640, 480, Layout::Nchw));
        assert_eq!(nchw.dims(), [1, 3, 480, 640]);

        let nhwc = InputShape::from_dims(&[1, 640, 320, 3])?;
        assert_eq!((nhwc.width, nhwc.height, nhwc.layout), (320, 640, Layout::Nhwc));
        assert_eq!(nhwc.zeros().shape(), &[1, 640, 320, 3]);

        assert!(InputShape::from_dims(&[1, 1, 28, 28]).is_err());
        assert!(InputShape::from_dims(&[3, 640, 640]).is_err());

        Ok(())
    }

    #[test]
    fn test_pinned_shape_follows_layout() -> Result<(), SegError> {
        let nchw = InputShape::pinned(320, 256, Layout::Nchw);
        assert_eq!(nchw.dims(), [1, 3, 256, 320]);

        let nhwc = InputShape::pinned(320, 256, Layout::Nhwc);
        assert_eq!(nhwc.dims(), [1, 256, 320, 3]);
        // The optimized graph reports the pinned dims back, read in the same layout
        assert_eq!(InputShape::from_dims(&nhwc.dims())?, nhwc);

        Ok(())
    }

    #[test]
    fn test_check_input() -> Result<(), SegError> {
        let shape = InputShape::from_dims(&[1, 3, 32, 32])?;
        assert!(check_input(&shape, &shape.zeros()).is_ok());

        let res = check_input(&shape, &Array4::zeros([1, 3, 32, 16]));
        match res {
            Err(SegError::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, vec![1, 3, 32, 32]);
                assert_eq!(actual, vec![1, 3, 32, 16]);
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn test_garbage_model_is_a_format_error() {
        let res = TractModel::from_bytes(b"definitely not protobuf", None);
        assert!(matches!(res, Err(SegError::ModelFormat(_))));
    }
}
