//! Inference engine: the loaded classifier plus the input contract it expects.
//!
//! The engine is built once by the `ModelBootstrapper` and shared read-only
//! as `Arc<InferenceEngine>`. Nothing in the request path mutates it.

pub mod bootstrap;
pub mod mock;
#[cfg(feature = "onnx-runtime")]
mod onnx;

pub use bootstrap::{
    ArtifactFetcher, ArtifactLoader, BootstrapError, EngineCell, HttpFetcher, ModelBootstrapper,
};
pub use mock::MockClassifier;
#[cfg(feature = "onnx-runtime")]
pub use onnx::{OnnxClassifier, OnnxLoader};

use ndarray::{Array2, Array4};
use thiserror::Error;

use crate::models::DiagnosticClass;
use crate::pipeline::encode::{BackboneNormalization, TensorLayout};
use crate::pipeline::preprocess::MODEL_INPUT_SIZE;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Encoder expects 3-channel input, got {0} channels")]
    ChannelInvariant(usize),

    #[error("Pixel buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("Tensor construction failed: {0}")]
    Tensor(String),

    #[error("Input batch shape {actual:?} does not match expected {expected:?}")]
    BatchShape {
        expected: [usize; 4],
        actual: [usize; 4],
    },

    #[error("Model execution failed: {0}")]
    Execution(String),

    #[error("Unexpected model output: {0}")]
    InvalidOutput(String),

    #[error("Inference session lock poisoned")]
    LockPoisoned,
}

/// A classifier that maps a batch of encoded images to per-class probabilities.
///
/// `infer` receives a 4-D batch in the engine's layout and returns one row
/// per batch item, one column per class. Rows are expected to be softmax
/// output already.
pub trait ClassificationModel: Send + Sync {
    fn infer(&self, batch: &Array4<f32>) -> Result<Array2<f32>, InferenceError>;
    fn class_count(&self) -> usize;
}

/// Allow `Box<dyn ClassificationModel>` to be used as `&impl ClassificationModel`.
impl ClassificationModel for Box<dyn ClassificationModel> {
    fn infer(&self, batch: &Array4<f32>) -> Result<Array2<f32>, InferenceError> {
        (**self).infer(batch)
    }

    fn class_count(&self) -> usize {
        (**self).class_count()
    }
}

/// Loaded model handle. Read-only after construction.
pub struct InferenceEngine {
    model: Box<dyn ClassificationModel>,
    input_size: u32,
    normalization: BackboneNormalization,
    layout: TensorLayout,
}

impl InferenceEngine {
    pub fn new(
        model: Box<dyn ClassificationModel>,
        input_size: u32,
        normalization: BackboneNormalization,
        layout: TensorLayout,
    ) -> Self {
        Self {
            model,
            input_size,
            normalization,
            layout,
        }
    }

    /// Engine with the production input contract: 160x160, ResNet50 caffe
    /// normalization, NHWC.
    pub fn with_defaults(model: Box<dyn ClassificationModel>) -> Self {
        Self::new(
            model,
            MODEL_INPUT_SIZE,
            BackboneNormalization::resnet50_caffe(),
            TensorLayout::Nhwc,
        )
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn normalization(&self) -> &BackboneNormalization {
        &self.normalization
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn class_count(&self) -> usize {
        self.model.class_count()
    }

    /// Run one batched model call.
    ///
    /// Checks the batch against the engine's geometry before the call and the
    /// output against `[batch, classes]` after it. A single attempt is made.
    pub fn run(&self, batch: &Array4<f32>) -> Result<Array2<f32>, InferenceError> {
        let size = self.input_size as usize;
        let n = batch.shape()[0];
        let expected = self.layout.batch_shape(n, size);
        let actual = [
            batch.shape()[0],
            batch.shape()[1],
            batch.shape()[2],
            batch.shape()[3],
        ];
        if n == 0 || actual != expected {
            return Err(InferenceError::BatchShape { expected, actual });
        }

        let output = self.model.infer(batch)?;

        let classes = DiagnosticClass::count();
        if output.nrows() != n || output.ncols() != classes {
            return Err(InferenceError::InvalidOutput(format!(
                "shape {:?}, expected [{n}, {classes}]",
                output.shape()
            )));
        }
        Ok(output)
    }
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("input_size", &self.input_size)
            .field("normalization", &self.normalization)
            .field("layout", &self.layout)
            .field("classes", &self.model.class_count())
            .finish()
    }
}
