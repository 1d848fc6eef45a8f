//! Test-time augmentation: classify the canonical image and its mirror in
//! one batched call, then average the two probability rows.

use image::RgbImage;
use ndarray::ArrayView1;
use tracing::debug;

use super::encode::{encode, stack_batch, ModelInput};
use super::preprocess::CanonicalImage;
use crate::engine::{InferenceEngine, InferenceError};
use crate::models::DiagnosticClass;

/// Tolerance on a model row summing to 1. The mean of accepted rows
/// stays within the same bound.
pub const ROW_SUM_TOLERANCE: f32 = 1e-4;

/// Variants per prediction. Confidence values depend on this number.
pub const TTA_VARIANT_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtaVariant {
    Identity,
    HorizontalMirror,
}

impl TtaVariant {
    /// Batch order. Fixed; not selectable per request.
    pub const ALL: [TtaVariant; TTA_VARIANT_COUNT] = [Self::Identity, Self::HorizontalMirror];

    pub fn apply(self, image: &RgbImage) -> RgbImage {
        match self {
            Self::Identity => image.clone(),
            Self::HorizontalMirror => image::imageops::flip_horizontal(image),
        }
    }
}

/// A canonical image after one label-preserving transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AugmentedVariant {
    variant: TtaVariant,
    image: RgbImage,
}

impl AugmentedVariant {
    pub fn variant(&self) -> TtaVariant {
        self.variant
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

impl ModelInput for AugmentedVariant {
    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn channel_count(&self) -> usize {
        3
    }

    fn samples(&self) -> &[u8] {
        self.image.as_raw()
    }
}

pub fn build_variants(canonical: &CanonicalImage) -> Vec<AugmentedVariant> {
    TtaVariant::ALL
        .iter()
        .map(|&variant| AugmentedVariant {
            variant,
            image: variant.apply(canonical.image()),
        })
        .collect()
}

/// One model output row: one non-negative probability per class, summing to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityVector(Vec<f32>);

impl ProbabilityVector {
    pub fn from_row(row: ArrayView1<'_, f32>) -> Result<Self, InferenceError> {
        let classes = DiagnosticClass::count();
        if row.len() != classes {
            return Err(InferenceError::InvalidOutput(format!(
                "row has {} entries, expected {classes}",
                row.len()
            )));
        }
        if let Some(bad) = row.iter().find(|p| !p.is_finite() || **p < 0.0) {
            return Err(InferenceError::InvalidOutput(format!(
                "probability {bad} outside [0, 1]"
            )));
        }
        let sum: f32 = row.sum();
        if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
            return Err(InferenceError::InvalidOutput(format!(
                "row sums to {sum}, expected 1"
            )));
        }
        Ok(Self(row.to_vec()))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// Arithmetic mean of the variants' probability vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedPrediction {
    probabilities: Vec<f32>,
    variant_count: usize,
}

impl AggregatedPrediction {
    pub fn probabilities(&self) -> &[f32] {
        &self.probabilities
    }

    pub fn variant_count(&self) -> usize {
        self.variant_count
    }

    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }
}

/// Average probability vectors column-wise. Sums accumulate in f64.
pub fn aggregate(vectors: &[ProbabilityVector]) -> Result<AggregatedPrediction, InferenceError> {
    let first = vectors
        .first()
        .ok_or_else(|| InferenceError::InvalidOutput("no probability vectors".into()))?;
    let classes = first.as_slice().len();

    let mut sums = vec![0.0f64; classes];
    for v in vectors {
        if v.as_slice().len() != classes {
            return Err(InferenceError::InvalidOutput(
                "probability vectors differ in length".into(),
            ));
        }
        for (acc, &p) in sums.iter_mut().zip(v.as_slice()) {
            *acc += p as f64;
        }
    }

    let n = vectors.len() as f64;
    Ok(AggregatedPrediction {
        probabilities: sums.into_iter().map(|s| (s / n) as f32).collect(),
        variant_count: vectors.len(),
    })
}

/// Encode both variants, run them as one batch, and average the rows.
pub fn predict_vector(
    engine: &InferenceEngine,
    canonical: &CanonicalImage,
) -> Result<AggregatedPrediction, InferenceError> {
    let variants = build_variants(canonical);

    let tensors = variants
        .iter()
        .map(|v| encode(v, engine.normalization(), engine.layout()))
        .collect::<Result<Vec<_>, _>>()?;
    let batch = stack_batch(&tensors)?;

    let output = engine.run(&batch)?;
    let vectors = output
        .rows()
        .into_iter()
        .map(ProbabilityVector::from_row)
        .collect::<Result<Vec<_>, _>>()?;

    let aggregated = aggregate(&vectors)?;
    debug!(
        variants = aggregated.variant_count(),
        batch_shape = ?batch.shape(),
        "TTA ensemble complete"
    );
    Ok(aggregated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ClassificationModel, MockClassifier};
    use crate::pipeline::preprocess::{CanonicalPreprocessor, Preprocessor, RawImage};
    use image::Rgb;
    use ndarray::{s, Array2, Array4, Axis};
    use std::sync::{Arc, Mutex};

    fn canonical(width: u32, height: u32) -> CanonicalImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
        });
        let raw = RawImage::new(width, height, 3, img.into_raw()).unwrap();
        CanonicalPreprocessor::default().normalize(&raw).unwrap()
    }

    /// Delegates to the mock and keeps every batch it was handed.
    struct RecordingModel {
        inner: MockClassifier,
        batches: Arc<Mutex<Vec<Array4<f32>>>>,
    }

    impl ClassificationModel for RecordingModel {
        fn infer(&self, batch: &Array4<f32>) -> Result<Array2<f32>, InferenceError> {
            self.batches.lock().unwrap().push(batch.clone());
            self.inner.infer(batch)
        }

        fn class_count(&self) -> usize {
            self.inner.class_count()
        }
    }

    fn uniform_row() -> Vec<f32> {
        vec![1.0 / 14.0; 14]
    }

    fn pv(values: Vec<f32>) -> ProbabilityVector {
        ProbabilityVector::from_row(ndarray::Array1::from(values).view()).unwrap()
    }

    #[test]
    fn variants_are_identity_then_mirror() {
        let c = canonical(50, 50);
        let variants = build_variants(&c);
        assert_eq!(variants.len(), TTA_VARIANT_COUNT);
        assert_eq!(variants[0].variant(), TtaVariant::Identity);
        assert_eq!(variants[0].image(), c.image());
        assert_eq!(variants[1].variant(), TtaVariant::HorizontalMirror);
        let side = c.size();
        assert_eq!(
            variants[1].image().get_pixel(0, 7),
            c.image().get_pixel(side - 1, 7)
        );
    }

    #[test]
    fn end_to_end_single_batched_call() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let model = RecordingModel {
            inner: MockClassifier::new(),
            batches: batches.clone(),
        };
        let engine = InferenceEngine::with_defaults(Box::new(model));

        let agg = predict_vector(&engine, &canonical(300, 200)).unwrap();
        assert_eq!(agg.len(), 14);
        assert_eq!(agg.variant_count(), 2);
        let sum: f32 = agg.probabilities().iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);

        let seen = batches.lock().unwrap();
        assert_eq!(seen.len(), 1, "exactly one model call");
        let batch = &seen[0];
        assert_eq!(batch.shape(), &[2, 160, 160, 3]);

        // Second item is the first mirrored along the width axis.
        let original = batch.index_axis(Axis(0), 0);
        let mirrored = batch.index_axis(Axis(0), 1);
        assert_eq!(original.slice(s![.., ..;-1, ..]), mirrored);
    }

    #[test]
    fn nchw_engine_batches_channel_first() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let model = RecordingModel {
            inner: MockClassifier::new(),
            batches: batches.clone(),
        };
        let engine = InferenceEngine::new(
            Box::new(model),
            160,
            crate::pipeline::BackboneNormalization::imagenet(),
            crate::pipeline::TensorLayout::Nchw,
        );
        predict_vector(&engine, &canonical(64, 64)).unwrap();
        assert_eq!(batches.lock().unwrap()[0].shape(), &[2, 3, 160, 160]);
    }

    #[test]
    fn aggregate_is_arithmetic_mean() {
        let mut a = vec![0.0; 14];
        a[0] = 1.0;
        let mut b = vec![0.0; 14];
        b[1] = 0.5;
        b[2] = 0.5;
        let agg = aggregate(&[pv(a), pv(b)]).unwrap();
        assert_eq!(agg.probabilities()[0], 0.5);
        assert_eq!(agg.probabilities()[1], 0.25);
        assert_eq!(agg.probabilities()[2], 0.25);
        assert!(aggregate(&[]).is_err());
    }

    #[test]
    fn rejects_rows_that_are_not_distributions() {
        let short = ndarray::Array1::from(vec![0.5f32, 0.5]);
        assert!(ProbabilityVector::from_row(short.view()).is_err());

        let mut negative = uniform_row();
        negative[0] = -0.1;
        negative[1] += 0.1;
        let negative = ndarray::Array1::from(negative);
        assert!(ProbabilityVector::from_row(negative.view()).is_err());

        let unnormalized = ndarray::Array1::from(vec![0.5f32; 14]);
        assert!(ProbabilityVector::from_row(unnormalized.view()).is_err());

        let mut nan = uniform_row();
        nan[3] = f32::NAN;
        let nan = ndarray::Array1::from(nan);
        assert!(ProbabilityVector::from_row(nan.view()).is_err());
    }

    #[test]
    fn row_sum_drift_beyond_1e4_is_rejected() {
        let mut drifted = uniform_row();
        drifted[0] += 9e-4;
        let drifted = ndarray::Array1::from(drifted);
        assert!(matches!(
            ProbabilityVector::from_row(drifted.view()),
            Err(InferenceError::InvalidOutput(_))
        ));

        let mut close = uniform_row();
        close[0] += 2e-5;
        let close = ndarray::Array1::from(close);
        let accepted = ProbabilityVector::from_row(close.view()).unwrap();
        let agg = aggregate(&[accepted, pv(uniform_row())]).unwrap();
        let sum: f32 = agg.probabilities().iter().sum();
        assert!((sum - 1.0).abs() <= ROW_SUM_TOLERANCE);
    }

    #[test]
    fn malformed_model_output_is_inference_error() {
        let engine =
            InferenceEngine::with_defaults(Box::new(MockClassifier::fixed(vec![0.5; 14])));
        let err = predict_vector(&engine, &canonical(40, 40)).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidOutput(_)));
    }

    #[test]
    fn fixed_rows_average_to_themselves() {
        let mut row = vec![0.0; 14];
        row[4] = 0.7;
        row[9] = 0.3;
        let engine = InferenceEngine::with_defaults(Box::new(MockClassifier::fixed(row.clone())));
        let agg = predict_vector(&engine, &canonical(40, 40)).unwrap();
        for (got, want) in agg.probabilities().iter().zip(&row) {
            assert!((got - want).abs() < 1e-6);
        }
        assert_eq!(agg.probabilities().iter().filter(|p| **p > 0.0).count(), 2);
    }
}
