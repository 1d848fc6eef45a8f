use serde::Serialize;

use super::ensemble::AggregatedPrediction;
use crate::models::DiagnosticClass;

/// Final answer for one image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PredictionResult {
    #[serde(rename = "class")]
    pub label: DiagnosticClass,
    pub confidence: f32,
}

/// Argmax over the aggregated vector. Ties go to the lowest class index.
///
/// No thresholding: a low-confidence result is still a definite class.
pub fn decide(prediction: &AggregatedPrediction) -> PredictionResult {
    let (index, confidence) = prediction
        .probabilities()
        .iter()
        .copied()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (i, p)| {
            if p > best.1 {
                (i, p)
            } else {
                best
            }
        });

    // Aggregated vectors always carry one entry per class, so the index is
    // in range and the confidence is a mean of values in [0, 1].
    let label = DiagnosticClass::from_index(index).unwrap_or(DiagnosticClass::ALL[0]);
    PredictionResult {
        label,
        confidence: confidence.clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ensemble::{aggregate, ProbabilityVector};
    use ndarray::Array1;

    fn aggregated(row: Vec<f32>) -> AggregatedPrediction {
        let v = ProbabilityVector::from_row(Array1::from(row).view()).unwrap();
        aggregate(&[v]).unwrap()
    }

    #[test]
    fn picks_maximum() {
        let mut row = vec![0.02; 14];
        row[6] = 0.74;
        let result = decide(&aggregated(row));
        assert_eq!(result.label, DiagnosticClass::KidneyStone);
        assert!((result.confidence - 0.74).abs() < 1e-6);
    }

    #[test]
    fn ties_go_to_lowest_index() {
        let mut row = vec![0.0; 14];
        row[3] = 0.5;
        row[11] = 0.5;
        let result = decide(&aggregated(row));
        assert_eq!(result.label, DiagnosticClass::ChestPneumonia);
    }

    #[test]
    fn uniform_vector_selects_first_class() {
        let result = decide(&aggregated(vec![1.0 / 14.0; 14]));
        assert_eq!(result.label, DiagnosticClass::BrainHemorrhage);
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);
    }

    #[test]
    fn serializes_with_wire_label() {
        let mut row = vec![0.0; 14];
        row[12] = 1.0;
        let json = serde_json::to_value(decide(&aggregated(row))).unwrap();
        assert_eq!(json["class"], "Lungs_TB");
        assert_eq!(json["confidence"], 1.0);
    }
}
