use std::path::Path;
use std::sync::Mutex;

use ndarray::{Array2, Array4};
use ort::session::Session;

use super::bootstrap::{ArtifactLoader, BootstrapError};
use super::{ClassificationModel, InferenceError};
use crate::models::DiagnosticClass;

/// Diagnostic classifier running on ONNX Runtime.
///
/// Uses interior mutability (Mutex) because `ort::Session::run` requires
/// `&mut self` while `ClassificationModel` exposes `&self`. The lock also
/// serialises concurrent requests against one session.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    class_count: usize,
}

impl OnnxClassifier {
    /// Load the classifier from a single `.onnx` file.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, BootstrapError> {
        if !model_path.is_file() {
            return Err(BootstrapError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()
            .map_err(|e: ort::Error| BootstrapError::ModelInit(e.to_string()))?
            .with_intra_threads(intra_threads)
            .map_err(|e: ort::Error| BootstrapError::ModelInit(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e: ort::Error| BootstrapError::ModelInit(format!("ONNX load failed: {e}")))?;

        tracing::info!("ONNX classifier loaded from {}", model_path.display());

        Ok(Self {
            session: Mutex::new(session),
            class_count: DiagnosticClass::count(),
        })
    }
}

impl ClassificationModel for OnnxClassifier {
    fn infer(&self, batch: &Array4<f32>) -> Result<Array2<f32>, InferenceError> {
        use ort::value::TensorRef;

        let input = TensorRef::from_array_view(batch)
            .map_err(|e| InferenceError::Tensor(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| InferenceError::LockPoisoned)?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| InferenceError::Execution(format!("ONNX inference failed: {e}")))?;

        // Output shape: [batch, classes], softmax probabilities
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::InvalidOutput(format!("Output extraction: {e}")))?;

        let rows = batch.shape()[0];
        if shape.len() != 2 || shape[0] as usize != rows || shape[1] as usize != self.class_count
        {
            return Err(InferenceError::InvalidOutput(format!(
                "Unexpected output shape: {shape:?}, expected [{rows}, {}]",
                self.class_count
            )));
        }

        Array2::from_shape_vec((rows, self.class_count), data.to_vec())
            .map_err(|e| InferenceError::InvalidOutput(e.to_string()))
    }

    fn class_count(&self) -> usize {
        self.class_count
    }
}

/// Loads `.onnx` artifacts into `OnnxClassifier`s.
pub struct OnnxLoader {
    intra_threads: usize,
}

impl OnnxLoader {
    pub fn new(intra_threads: usize) -> Self {
        Self { intra_threads }
    }
}

impl ArtifactLoader for OnnxLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn ClassificationModel>, BootstrapError> {
        Ok(Box::new(OnnxClassifier::load(path, self.intra_threads)?))
    }
}
