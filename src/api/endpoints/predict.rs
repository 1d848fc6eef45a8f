//! `POST /predict`: classify one image and echo the patient metadata.

use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::pipeline::{DiagnosticPipeline, PredictRequest, PredictionResponse};

/// Runs the synchronous pipeline on the blocking pool.
///
/// Body shape: `{ "payload": { "image_base64" | "image_path", age?, weight?,
/// symptoms?, body_part? } }`.
pub async fn predict(
    State(ctx): State<ApiContext>,
    body: Result<Json<PredictRequest>, JsonRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let Json(request) = body?;
    let engine = ctx.engine.get().ok_or(ApiError::ModelNotReady)?;

    let request_id = Uuid::new_v4();
    let start = Instant::now();

    let result = tokio::task::spawn_blocking(move || {
        DiagnosticPipeline::new(engine).handle(&request)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Prediction task failed: {e}")))?;

    match result {
        Ok(response) => {
            tracing::info!(
                %request_id,
                label = %response.prediction.label,
                confidence = response.prediction.confidence,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Prediction served"
            );
            Ok(Json(response))
        }
        Err(e) => {
            tracing::info!(
                %request_id,
                code = e.code(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Prediction request failed"
            );
            Err(e.into())
        }
    }
}
