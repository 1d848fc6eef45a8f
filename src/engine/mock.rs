use ndarray::{Array2, Array4, Axis};

use super::{ClassificationModel, InferenceError};
use crate::models::DiagnosticClass;

#[derive(Debug, Clone)]
enum MockBehavior {
    /// Softmax over logits derived from the batch item's pixel statistics.
    PixelStatistics,
    /// The same row for every batch item.
    Fixed(Vec<f32>),
    Failing,
}

/// Mock classifier for testing. Produces deterministic probability rows.
#[derive(Debug, Clone)]
pub struct MockClassifier {
    behavior: MockBehavior,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self {
            behavior: MockBehavior::PixelStatistics,
        }
    }

    /// Always return `row` for each batch item. `row.len()` becomes the
    /// reported class count.
    pub fn fixed(row: Vec<f32>) -> Self {
        Self {
            behavior: MockBehavior::Fixed(row),
        }
    }

    pub fn failing() -> Self {
        Self {
            behavior: MockBehavior::Failing,
        }
    }
}

impl Default for MockClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassificationModel for MockClassifier {
    fn infer(&self, batch: &Array4<f32>) -> Result<Array2<f32>, InferenceError> {
        let n = batch.shape()[0];
        match &self.behavior {
            MockBehavior::Failing => Err(InferenceError::Execution(
                "mock model configured to fail".into(),
            )),
            MockBehavior::Fixed(row) => {
                let mut out = Array2::<f32>::zeros((n, row.len()));
                for mut out_row in out.axis_iter_mut(Axis(0)) {
                    for (slot, &p) in out_row.iter_mut().zip(row) {
                        *slot = p;
                    }
                }
                Ok(out)
            }
            MockBehavior::PixelStatistics => {
                let classes = DiagnosticClass::count();
                let mut out = Array2::<f32>::zeros((n, classes));
                for (item, mut out_row) in batch.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0)))
                {
                    let row = statistics_softmax(item.iter().copied(), classes);
                    for (slot, p) in out_row.iter_mut().zip(row) {
                        *slot = p;
                    }
                }
                Ok(out)
            }
        }
    }

    fn class_count(&self) -> usize {
        match &self.behavior {
            MockBehavior::Fixed(row) => row.len(),
            _ => DiagnosticClass::count(),
        }
    }
}

/// Deterministic softmax over logits seeded by the mean and spread of the values.
fn statistics_softmax(values: impl Iterator<Item = f32>, classes: usize) -> Vec<f32> {
    let (mut sum, mut sum_sq, mut count) = (0.0f64, 0.0f64, 0usize);
    for v in values {
        let v = v as f64;
        sum += v;
        sum_sq += v * v;
        count += 1;
    }
    let mean = if count > 0 { sum / count as f64 } else { 0.0 };
    let spread = if count > 0 {
        (sum_sq / count as f64 - mean * mean).max(0.0).sqrt()
    } else {
        0.0
    };

    let logits: Vec<f64> = (0..classes)
        .map(|k| {
            let k = k as f64 + 1.0;
            (mean / 37.0 * k).sin() + (spread / 29.0 * k).cos()
        })
        .collect();
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f64 = exp.iter().sum();
    exp.iter().map(|e| (e / total) as f32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_rows_sum_to_one() {
        let model = MockClassifier::new();
        let batch = Array4::<f32>::from_elem((3, 4, 4, 3), 12.5);
        let out = model.infer(&batch).unwrap();
        for row in out.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn mock_is_deterministic() {
        let model = MockClassifier::new();
        let batch = Array4::<f32>::from_shape_fn((1, 4, 4, 3), |(_, y, x, c)| {
            (y * 7 + x * 3 + c) as f32
        });
        let a = model.infer(&batch).unwrap();
        let b = model.infer(&batch).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fixed_repeats_row() {
        let model = MockClassifier::fixed(vec![0.25, 0.75]);
        let batch = Array4::<f32>::zeros((2, 1, 1, 3));
        let out = model.infer(&batch).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out[[1, 1]], 0.75);
        assert_eq!(model.class_count(), 2);
    }

    #[test]
    fn failing_returns_execution_error() {
        let model = MockClassifier::failing();
        let batch = Array4::<f32>::zeros((1, 1, 1, 3));
        assert!(matches!(
            model.infer(&batch),
            Err(InferenceError::Execution(_))
        ));
    }
}
