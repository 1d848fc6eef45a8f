//! Request validation and the full predict sequence:
//! image source -> RawImage -> Preprocessor -> TTA ensemble -> decision.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::decision::{decide, PredictionResult};
use super::ensemble::predict_vector;
use super::preprocess::{CanonicalPreprocessor, Preprocessor, RawImage, MAX_IMAGE_BYTES};
use super::{InputError, PipelineError, PreprocessError};
use crate::engine::InferenceEngine;

// ═══════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════

/// Request envelope: `{ "payload": { ... } }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictRequest {
    #[serde(default)]
    pub payload: Option<PredictPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictPayload {
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub age: Option<serde_json::Value>,
    #[serde(default)]
    pub weight: Option<serde_json::Value>,
    #[serde(default)]
    pub symptoms: Option<String>,
    #[serde(default)]
    pub body_part: Option<String>,
}

/// Patient metadata echoed back untouched. Never read by inference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatientContext {
    pub age: Option<serde_json::Value>,
    pub weight: Option<serde_json::Value>,
    pub symptoms: String,
    pub body_part: String,
}

impl From<&PredictPayload> for PatientContext {
    fn from(payload: &PredictPayload) -> Self {
        Self {
            age: payload.age.clone(),
            weight: payload.weight.clone(),
            symptoms: payload.symptoms.clone().unwrap_or_default(),
            body_part: payload.body_part.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResponse {
    pub prediction: PredictionResult,
    pub patient_info: PatientContext,
}

// ═══════════════════════════════════════════════════════════
// Image source
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Decoded bytes from `image_base64`.
    Inline(Vec<u8>),
    /// Existing server-local file from `image_path`.
    LocalFile(PathBuf),
}

impl ImageSource {
    /// Local files are checked against `MAX_IMAGE_BYTES` before any byte is
    /// buffered, and the read itself never goes past the cap.
    pub fn read_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        match self {
            Self::Inline(bytes) => Ok(bytes.clone()),
            Self::LocalFile(path) => read_capped(path),
        }
    }
}

fn read_capped(path: &Path) -> Result<Vec<u8>, PipelineError> {
    let unreadable = |e: std::io::Error| InputError::UnreadableFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let too_large = |size: usize| PreprocessError::ImageTooLarge {
        size,
        limit_mb: MAX_IMAGE_BYTES / (1024 * 1024),
    };

    let file = File::open(path).map_err(unreadable)?;
    let len = file.metadata().map_err(unreadable)?.len();
    if len > MAX_IMAGE_BYTES as u64 {
        return Err(too_large(usize::try_from(len).unwrap_or(usize::MAX)).into());
    }

    // The file can grow between stat and read.
    let mut bytes = Vec::with_capacity(len as usize);
    file.take(MAX_IMAGE_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .map_err(unreadable)?;
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(too_large(bytes.len()).into());
    }
    Ok(bytes)
}

/// Exactly one of `image_base64` / `image_path` must be set.
/// Blank strings count as absent.
pub fn resolve_image_source(payload: &PredictPayload) -> Result<ImageSource, InputError> {
    let inline = non_blank(payload.image_base64.as_deref());
    let path = non_blank(payload.image_path.as_deref());

    match (inline, path) {
        (None, None) => Err(InputError::NoImageSource),
        (Some(_), Some(_)) => Err(InputError::ConflictingImageSources),
        (Some(data), None) => decode_base64(data).map(ImageSource::Inline),
        (None, Some(path)) => {
            let path = Path::new(path);
            if !path.is_file() {
                return Err(InputError::FileNotFound(path.to_path_buf()));
            }
            Ok(ImageSource::LocalFile(path.to_path_buf()))
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Standard-alphabet base64, with an optional `data:<mime>;base64,` prefix.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, InputError> {
    let data = data.trim();
    let data = match data.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, body)| body)
            .ok_or_else(|| InputError::InvalidBase64("data URL without ',' separator".into()))?,
        None => data,
    };
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| InputError::InvalidBase64(e.to_string()))
}

// ═══════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════

/// One classification pipeline bound to a loaded engine.
///
/// Synchronous end to end. Cheap to build per request: the engine is shared.
pub struct DiagnosticPipeline {
    engine: Arc<InferenceEngine>,
    preprocessor: Box<dyn Preprocessor>,
}

impl DiagnosticPipeline {
    pub fn new(engine: Arc<InferenceEngine>) -> Self {
        let preprocessor = CanonicalPreprocessor::new(engine.input_size());
        Self::with_preprocessor(engine, Box::new(preprocessor))
    }

    pub fn with_preprocessor(
        engine: Arc<InferenceEngine>,
        preprocessor: Box<dyn Preprocessor>,
    ) -> Self {
        Self {
            engine,
            preprocessor,
        }
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    /// Preprocessor -> TTA ensemble -> decision for an already decoded image.
    pub fn classify(&self, raw: &RawImage) -> Result<PredictionResult, PipelineError> {
        let canonical = self.preprocessor.normalize(raw)?;
        let aggregated = predict_vector(&self.engine, &canonical)?;
        Ok(decide(&aggregated))
    }

    /// Validate the payload, decode the image, classify, attach patient info.
    pub fn predict(&self, payload: &PredictPayload) -> Result<PredictionResponse, PipelineError> {
        let start = Instant::now();

        let source = resolve_image_source(payload)?;
        let bytes = source.read_bytes()?;
        let raw = RawImage::decode(&bytes)?;
        let prediction = self.classify(&raw)?;

        tracing::debug!(
            width = raw.width(),
            height = raw.height(),
            channels = raw.channels(),
            label = %prediction.label,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Prediction complete"
        );

        Ok(PredictionResponse {
            prediction,
            patient_info: PatientContext::from(payload),
        })
    }

    /// Entry point for the request envelope.
    pub fn handle(&self, request: &PredictRequest) -> Result<PredictionResponse, PipelineError> {
        let payload = request
            .payload
            .as_ref()
            .ok_or(InputError::MissingPayload)?;
        self.predict(payload)
    }
}
