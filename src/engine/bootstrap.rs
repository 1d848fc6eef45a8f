//! Model bootstrapper: makes sure the classifier artifact is cached locally,
//! then loads it into an `InferenceEngine` exactly once per process.
//!
//! Any failure here is a startup failure. The service does not begin
//! serving requests without a loaded engine.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ClassificationModel, InferenceEngine};
use crate::config::ServiceConfig;
use crate::models::DiagnosticClass;
use crate::pipeline::encode::{BackboneNormalization, TensorLayout};
use crate::pipeline::preprocess::MODEL_INPUT_SIZE;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model artifact not cached at {0} and no download URL configured")]
    NoSource(PathBuf),

    #[error("Model artifact not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Model download from {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("Model download from {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Downloaded model artifact is empty")]
    EmptyArtifact,

    #[error("Model initialization: {0}")]
    ModelInit(String),

    #[error("Model produces {actual} classes, expected {expected}")]
    ClassCount { expected: usize, actual: usize },

    #[error("Engine cell lock poisoned")]
    LockPoisoned,
}

// ═══════════════════════════════════════════════════════════
// Service traits
// ═══════════════════════════════════════════════════════════

/// Retrieves the model artifact from its remote store.
pub trait ArtifactFetcher: Send + Sync {
    /// Stream the artifact at `url` into `dest`. Returns bytes written.
    fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<u64, BootstrapError>;
}

/// Turns a cached artifact into an inference-capable model.
pub trait ArtifactLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn ClassificationModel>, BootstrapError>;
}

// ── HttpFetcher ───────────────────────────────────────────

/// HTTPS download via a blocking `reqwest` client.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self, BootstrapError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| BootstrapError::HttpClient(e.to_string()))?;
        Ok(Self {
            client,
            timeout_secs,
        })
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<u64, BootstrapError> {
        let mut response = self.client.get(url).send().map_err(|e| {
            let reason = if e.is_timeout() {
                format!("timed out after {}s", self.timeout_secs)
            } else {
                e.to_string()
            };
            BootstrapError::Download {
                url: url.to_string(),
                reason,
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BootstrapError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .copy_to(dest)
            .map_err(|e| BootstrapError::Download {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}

// ── Loader fallback ───────────────────────────────────────

/// Loader used when the crate is built without ONNX Runtime.
#[cfg(not(feature = "onnx-runtime"))]
struct UnavailableLoader;

#[cfg(not(feature = "onnx-runtime"))]
impl ArtifactLoader for UnavailableLoader {
    fn load(&self, _path: &Path) -> Result<Box<dyn ClassificationModel>, BootstrapError> {
        Err(BootstrapError::ModelInit(
            "built without the onnx-runtime feature".into(),
        ))
    }
}

// ═══════════════════════════════════════════════════════════
// EngineCell: the once-initialised engine slot
// ═══════════════════════════════════════════════════════════

/// Holds the engine after it has been loaded. Shared with the HTTP layer
/// for readiness reporting and request handling.
#[derive(Default)]
pub struct EngineCell {
    slot: Mutex<Option<Arc<InferenceEngine>>>,
}

impl EngineCell {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn loaded(engine: Arc<InferenceEngine>) -> Self {
        Self {
            slot: Mutex::new(Some(engine)),
        }
    }

    /// The engine, if loading has completed.
    ///
    /// The slot is only written once, so a poisoned lock still holds a
    /// usable value.
    pub fn get(&self) -> Option<Arc<InferenceEngine>> {
        let slot = self.slot.lock().unwrap_or_else(|poisoned| {
            warn!("Engine cell lock poisoned; reading last stored engine");
            PoisonError::into_inner(poisoned)
        });
        slot.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.get().is_some()
    }
}

// ═══════════════════════════════════════════════════════════
// ModelBootstrapper
// ═══════════════════════════════════════════════════════════

pub struct ModelBootstrapper {
    model_path: PathBuf,
    model_url: Option<String>,
    layout: TensorLayout,
    fetcher: Box<dyn ArtifactFetcher>,
    loader: Box<dyn ArtifactLoader>,
    cell: Arc<EngineCell>,
}

impl ModelBootstrapper {
    pub fn new(
        model_path: PathBuf,
        model_url: Option<String>,
        layout: TensorLayout,
        fetcher: Box<dyn ArtifactFetcher>,
        loader: Box<dyn ArtifactLoader>,
    ) -> Self {
        Self {
            model_path,
            model_url,
            layout,
            fetcher,
            loader,
            cell: Arc::new(EngineCell::empty()),
        }
    }

    /// Production bootstrapper: HTTPS fetcher + ONNX Runtime loader.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, BootstrapError> {
        let fetcher = HttpFetcher::new(config.download_timeout_secs)?;

        #[cfg(feature = "onnx-runtime")]
        let loader: Box<dyn ArtifactLoader> = Box::new(super::OnnxLoader::new(config.intra_threads));
        #[cfg(not(feature = "onnx-runtime"))]
        let loader: Box<dyn ArtifactLoader> = Box::new(UnavailableLoader);

        Ok(Self::new(
            config.model_path.clone(),
            config.model_url.clone(),
            config.tensor_layout,
            Box::new(fetcher),
            loader,
        ))
    }

    /// Shared handle to the engine slot.
    pub fn cell(&self) -> Arc<EngineCell> {
        Arc::clone(&self.cell)
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Return the loaded engine, fetching and loading it on first call.
    ///
    /// The slot lock is held for the whole load, so concurrent first callers
    /// wait for a single load rather than racing.
    pub fn ensure_ready(&self) -> Result<Arc<InferenceEngine>, BootstrapError> {
        let mut slot = self
            .cell
            .slot
            .lock()
            .map_err(|_| BootstrapError::LockPoisoned)?;

        if let Some(engine) = slot.as_ref() {
            return Ok(Arc::clone(engine));
        }

        let path = self.ensure_artifact()?;
        let model = self.loader.load(&path)?;

        let expected = DiagnosticClass::count();
        if model.class_count() != expected {
            return Err(BootstrapError::ClassCount {
                expected,
                actual: model.class_count(),
            });
        }

        let engine = Arc::new(InferenceEngine::new(
            model,
            MODEL_INPUT_SIZE,
            BackboneNormalization::resnet50_caffe(),
            self.layout,
        ));
        info!(engine = ?engine, "Inference engine ready");

        *slot = Some(Arc::clone(&engine));
        Ok(engine)
    }

    /// Make sure the artifact exists at the cache path, downloading it if needed.
    ///
    /// Downloads land in a temp file in the cache directory and are renamed
    /// into place only after the full body has been written and synced.
    pub fn ensure_artifact(&self) -> Result<PathBuf, BootstrapError> {
        if self.model_path.is_file() {
            debug!(path = %self.model_path.display(), "Model artifact cache hit");
            return Ok(self.model_path.clone());
        }

        let url = self
            .model_url
            .as_deref()
            .ok_or_else(|| BootstrapError::NoSource(self.model_path.clone()))?;

        let dir = match self.model_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        info!(url, path = %self.model_path.display(), "Model artifact not cached, downloading");

        let mut staging = tempfile::NamedTempFile::new_in(&dir)?;
        let (bytes, digest) = {
            let mut writer = DigestWriter::new(staging.as_file_mut());
            let bytes = self.fetcher.fetch(url, &mut writer)?;
            writer.flush()?;
            (bytes, writer.finish())
        };

        if bytes == 0 {
            return Err(BootstrapError::EmptyArtifact);
        }

        staging.as_file().sync_all()?;
        staging
            .persist(&self.model_path)
            .map_err(|e| BootstrapError::Io(e.error))?;

        info!(bytes, sha256 = %digest, "Model artifact downloaded");
        Ok(self.model_path.clone())
    }
}

/// Writer adapter that hashes everything passing through it.
struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> DigestWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> String {
        self.hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockClassifier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticFetcher {
        body: Vec<u8>,
        calls: Arc<AtomicUsize>,
    }

    impl ArtifactFetcher for StaticFetcher {
        fn fetch(&self, _url: &str, dest: &mut dyn Write) -> Result<u64, BootstrapError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            dest.write_all(&self.body)?;
            Ok(self.body.len() as u64)
        }
    }

    struct FailingFetcher;

    impl ArtifactFetcher for FailingFetcher {
        fn fetch(&self, url: &str, _dest: &mut dyn Write) -> Result<u64, BootstrapError> {
            Err(BootstrapError::HttpStatus {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    struct MockLoader {
        calls: Arc<AtomicUsize>,
        model: MockClassifier,
    }

    impl ArtifactLoader for MockLoader {
        fn load(&self, path: &Path) -> Result<Box<dyn ClassificationModel>, BootstrapError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !path.is_file() {
                return Err(BootstrapError::ModelNotFound(path.to_path_buf()));
            }
            Ok(Box::new(self.model.clone()))
        }
    }

    struct CorruptLoader;

    impl ArtifactLoader for CorruptLoader {
        fn load(&self, _path: &Path) -> Result<Box<dyn ClassificationModel>, BootstrapError> {
            Err(BootstrapError::ModelInit("not an ONNX graph".into()))
        }
    }

    fn counting_bootstrapper(
        path: PathBuf,
        url: Option<&str>,
        body: &[u8],
    ) -> (ModelBootstrapper, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let loads = Arc::new(AtomicUsize::new(0));
        let bootstrapper = ModelBootstrapper::new(
            path,
            url.map(String::from),
            TensorLayout::Nhwc,
            Box::new(StaticFetcher {
                body: body.to_vec(),
                calls: Arc::clone(&fetches),
            }),
            Box::new(MockLoader {
                calls: Arc::clone(&loads),
                model: MockClassifier::new(),
            }),
        );
        (bootstrapper, fetches, loads)
    }

    #[test]
    fn cache_miss_downloads_then_loads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("models").join("classifier.onnx");
        let (bootstrapper, fetches, loads) =
            counting_bootstrapper(path.clone(), Some("https://example.org/m.onnx"), b"onnx-bytes");

        let engine = bootstrapper.ensure_ready().unwrap();
        assert_eq!(engine.class_count(), 14);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"onnx-bytes");
    }

    #[test]
    fn cache_hit_skips_download() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("classifier.onnx");
        std::fs::write(&path, b"cached").unwrap();
        let (bootstrapper, fetches, loads) =
            counting_bootstrapper(path.clone(), Some("https://example.org/m.onnx"), b"fresh");

        bootstrapper.ensure_ready().unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"cached");
    }

    #[test]
    fn repeated_calls_return_same_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("classifier.onnx");
        let (bootstrapper, fetches, loads) =
            counting_bootstrapper(path, Some("https://example.org/m.onnx"), b"bytes");

        let first = bootstrapper.ensure_ready().unwrap();
        let second = bootstrapper.ensure_ready().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cell_reports_readiness() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("classifier.onnx");
        let (bootstrapper, _, _) =
            counting_bootstrapper(path, Some("https://example.org/m.onnx"), b"bytes");
        let cell = bootstrapper.cell();

        assert!(!cell.is_ready());
        let engine = bootstrapper.ensure_ready().unwrap();
        assert!(cell.is_ready());
        assert!(Arc::ptr_eq(&cell.get().unwrap(), &engine));
    }

    #[test]
    fn missing_artifact_without_url_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("classifier.onnx");
        let (bootstrapper, fetches, _) = counting_bootstrapper(path, None, b"bytes");

        let err = bootstrapper.ensure_ready().unwrap_err();
        assert!(matches!(err, BootstrapError::NoSource(_)));
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        assert!(!bootstrapper.cell().is_ready());
    }

    #[test]
    fn download_failure_leaves_no_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("classifier.onnx");
        let bootstrapper = ModelBootstrapper::new(
            path.clone(),
            Some("https://example.org/missing.onnx".into()),
            TensorLayout::Nhwc,
            Box::new(FailingFetcher),
            Box::new(CorruptLoader),
        );

        let err = bootstrapper.ensure_ready().unwrap_err();
        assert!(matches!(err, BootstrapError::HttpStatus { status: 404, .. }));
        assert!(!path.exists());
        // Temp file is cleaned up on drop.
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn empty_download_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("classifier.onnx");
        let (bootstrapper, _, loads) =
            counting_bootstrapper(path.clone(), Some("https://example.org/m.onnx"), b"");

        let err = bootstrapper.ensure_ready().unwrap_err();
        assert!(matches!(err, BootstrapError::EmptyArtifact));
        assert!(!path.exists());
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn corrupt_artifact_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("classifier.onnx");
        std::fs::write(&path, b"garbage").unwrap();
        let bootstrapper = ModelBootstrapper::new(
            path,
            None,
            TensorLayout::Nhwc,
            Box::new(FailingFetcher),
            Box::new(CorruptLoader),
        );

        let err = bootstrapper.ensure_ready().unwrap_err();
        assert!(matches!(err, BootstrapError::ModelInit(_)));
        assert!(!bootstrapper.cell().is_ready());
    }

    #[test]
    fn wrong_class_count_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("classifier.onnx");
        std::fs::write(&path, b"cached").unwrap();
        let bootstrapper = ModelBootstrapper::new(
            path,
            None,
            TensorLayout::Nhwc,
            Box::new(FailingFetcher),
            Box::new(MockLoader {
                calls: Arc::new(AtomicUsize::new(0)),
                model: MockClassifier::fixed(vec![0.5, 0.5]),
            }),
        );

        let err = bootstrapper.ensure_ready().unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::ClassCount {
                expected: 14,
                actual: 2
            }
        ));
    }

    #[test]
    fn digest_writer_hashes_passthrough() {
        let mut sink = Vec::new();
        let mut writer = DigestWriter::new(&mut sink);
        writer.write_all(b"abc").unwrap();
        let digest = writer.finish();
        assert_eq!(sink, b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn poisoned_cell_still_serves_loaded_engine() {
        let engine = Arc::new(InferenceEngine::with_defaults(Box::new(MockClassifier::new())));
        let cell = Arc::new(EngineCell::loaded(Arc::clone(&engine)));

        let poisoner = Arc::clone(&cell);
        let outcome = std::thread::spawn(move || {
            let _guard = poisoner.slot.lock().unwrap();
            panic!("panic while holding the engine slot");
        })
        .join();
        assert!(outcome.is_err());
        assert!(cell.slot.is_poisoned());

        assert!(cell.is_ready());
        let served = cell.get().unwrap();
        assert!(Arc::ptr_eq(&served, &engine));
    }

    #[test]
    fn poisoned_empty_cell_reports_not_ready() {
        let cell = Arc::new(EngineCell::empty());
        let poisoner = Arc::clone(&cell);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.slot.lock().unwrap();
            panic!("panic while holding the engine slot");
        })
        .join();
        assert!(cell.get().is_none());
    }
}
