//! Shared state for the API router.

use std::sync::Arc;

use crate::engine::{EngineCell, InferenceEngine};

/// Shared context for all API routes.
///
/// Holds the engine readiness slot rather than the engine itself, so the
/// router can be mounted before the model has finished loading.
#[derive(Clone)]
pub struct ApiContext {
    pub engine: Arc<EngineCell>,
}

impl ApiContext {
    pub fn new(engine: Arc<EngineCell>) -> Self {
        Self { engine }
    }

    /// Context over an already loaded engine.
    pub fn ready(engine: Arc<InferenceEngine>) -> Self {
        Self::new(Arc::new(EngineCell::loaded(engine)))
    }
}
