use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::encode::TensorLayout;

/// Application-level constants
pub const APP_NAME: &str = "Mediscope";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default listen port. The web client expects the service on 5000.
pub const DEFAULT_PORT: u16 = 5000;

/// File name of the cached classifier artifact.
pub const MODEL_FILE_NAME: &str = "diagnostic_classifier.onnx";

const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_INTRA_THREADS: usize = 2;

/// Default tracing filter when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "mediscope=info,mediscope_lib=info,tower_http=warn"
}

/// Get the application data directory
/// ~/Mediscope/ on all platforms. Falls back to the working directory
/// when no home directory can be determined (containers, service accounts).
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Get the models directory (cached classifier artifacts)
pub fn models_dir() -> PathBuf {
    app_data_dir().join("models")
}

/// Default local cache path of the classifier artifact.
pub fn default_model_path() -> PathBuf {
    models_dir().join(MODEL_FILE_NAME)
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    /// Remote location of the classifier artifact. Only consulted on a cache miss.
    pub model_url: Option<String>,
    pub model_path: PathBuf,
    pub download_timeout_secs: u64,
    pub intra_threads: usize,
    pub tensor_layout: TensorLayout,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            model_url: None,
            model_path: default_model_path(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            intra_threads: DEFAULT_INTRA_THREADS,
            tensor_layout: TensorLayout::Nhwc,
        }
    }
}

impl ServiceConfig {
    /// Read `MEDISCOPE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings through an arbitrary lookup. Unset or blank
    /// variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(value) = get("MEDISCOPE_BIND") {
            config.bind_addr = value.parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::InvalidValue {
                    var: "MEDISCOPE_BIND",
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        config.model_url = get("MEDISCOPE_MODEL_URL");

        if let Some(value) = get("MEDISCOPE_MODEL_PATH") {
            config.model_path = PathBuf::from(value);
        }

        if let Some(value) = get("MEDISCOPE_DOWNLOAD_TIMEOUT_SECS") {
            config.download_timeout_secs =
                parse_positive("MEDISCOPE_DOWNLOAD_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = get("MEDISCOPE_INTRA_THREADS") {
            config.intra_threads = parse_positive("MEDISCOPE_INTRA_THREADS", &value)?;
        }

        if let Some(value) = get("MEDISCOPE_TENSOR_LAYOUT") {
            config.tensor_layout =
                value
                    .parse()
                    .map_err(|reason: String| ConfigError::InvalidValue {
                        var: "MEDISCOPE_TENSOR_LAYOUT",
                        value: value.clone(),
                        reason,
                    })?;
        }

        Ok(config)
    }
}

fn parse_positive<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let parsed: T = value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if parsed <= T::default() {
        return Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(parsed)
}
