pub mod api;
pub mod config;
pub mod engine;
pub mod models;
pub mod pipeline;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::api::ApiContext;
use crate::config::{ConfigError, ServiceConfig};
use crate::engine::{BootstrapError, ModelBootstrapper};

/// Anything that stops the service from coming up.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Model bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn run() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    if let Err(e) = start() {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

/// Load config, bootstrap the model (fatal on failure), then serve.
///
/// The bootstrapper uses a blocking HTTP client, so it runs before the
/// async runtime exists.
fn start() -> Result<(), StartupError> {
    let config = ServiceConfig::from_env()?;
    tracing::info!(
        bind = %config.bind_addr,
        model_path = %config.model_path.display(),
        layout = %config.tensor_layout,
        "Configuration loaded"
    );

    let bootstrapper = ModelBootstrapper::from_config(&config)?;
    let engine = bootstrapper.ensure_ready()?;
    tracing::info!(
        classes = engine.class_count(),
        input_size = engine.input_size(),
        "Inference engine ready"
    );

    let ctx = ApiContext::new(bootstrapper.cell());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(api::serve(config.bind_addr, ctx))?;
    Ok(())
}
