pub mod preprocess;
pub mod encode;
pub mod ensemble;
pub mod decision;
pub mod orchestrator;

pub use decision::{decide, PredictionResult};
pub use encode::{BackboneNormalization, EncodedTensor, TensorLayout};
pub use ensemble::{predict_vector, AggregatedPrediction, ProbabilityVector, TtaVariant};
pub use orchestrator::*;
pub use preprocess::{CanonicalImage, CanonicalPreprocessor, Preprocessor, RawImage};

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::InferenceError;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Image data is empty")]
    EmptyImage,

    #[error("Image data is {size} bytes, exceeds {limit_mb}MB limit")]
    ImageTooLarge { size: usize, limit_mb: usize },

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Unsupported channel count: {0} (expected 1, 3 or 4)")]
    UnsupportedChannelCount(u8),

    #[error("Image has zero area ({width}x{height})")]
    ZeroArea { width: u32, height: u32 },

    #[error("Pixel buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Missing payload")]
    MissingPayload,

    #[error("No image provided: supply image_base64 or image_path")]
    NoImageSource,

    #[error("Both image_base64 and image_path were provided; supply exactly one")]
    ConflictingImageSources,

    #[error("Invalid base64 image data: {0}")]
    InvalidBase64(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Cannot read {path}: {reason}")]
    UnreadableFile { path: PathBuf, reason: String },
}

/// Whose fault a failed prediction is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request: missing/invalid fields, undecodable or malformed image.
    Input,
    /// Model execution failed on a structurally valid tensor.
    Inference,
}

/// Every way a prediction request can fail. Callers branch on `kind()`.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error("Preprocessing failed: {0}")]
    Preprocessing(#[from] PreprocessError),

    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Input(_) | Self::Preprocessing(_) => ErrorKind::Input,
            Self::Inference(_) => ErrorKind::Inference,
        }
    }

    /// Stable machine-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Input(e) => match e {
                InputError::MissingPayload => "MISSING_PAYLOAD",
                InputError::NoImageSource => "NO_IMAGE",
                InputError::ConflictingImageSources => "CONFLICTING_IMAGE_SOURCES",
                InputError::InvalidBase64(_) => "INVALID_BASE64",
                InputError::FileNotFound(_) => "FILE_NOT_FOUND",
                InputError::UnreadableFile { .. } => "UNREADABLE_FILE",
            },
            Self::Preprocessing(e) => match e {
                PreprocessError::EmptyImage => "EMPTY_IMAGE",
                PreprocessError::ImageTooLarge { .. } => "IMAGE_TOO_LARGE",
                PreprocessError::Decode(_) => "UNDECODABLE_IMAGE",
                PreprocessError::UnsupportedChannelCount(_) => "UNSUPPORTED_CHANNELS",
                PreprocessError::ZeroArea { .. } | PreprocessError::BufferSize { .. } => {
                    "MALFORMED_IMAGE"
                }
            },
            Self::Inference(_) => "PREDICTION_FAILED",
        }
    }
}
