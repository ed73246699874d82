//! Loaded models and the loader seam.
//!
//! A [`Model`] only exists fully loaded: construction goes through
//! [`Model::load`], which either returns a usable model or an error with no
//! partial state left behind. Dropping the model releases its backend.

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::embedding::{EmbedError, ModelBackend, Token, TokenId};
use crate::options::{ModelOptions, OptionKey, PoolingType};

/// Prefix of the opaque handle strings that identify a loaded model.
pub const HANDLE_PREFIX: &str = "lembed-model:";

/// Where a model artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A file path, directory path or catalog name.
    Path(PathBuf),
    /// The artifact's raw bytes.
    Bytes(Vec<u8>),
}

impl ModelSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Stable identity of the artifact combined with the options used to load
    /// it. Two loads with equal fingerprints produce interchangeable models.
    pub fn fingerprint(&self, options: &ModelOptions) -> String {
        let mut hasher = Sha256::new();
        match self {
            Self::Path(path) => {
                hasher.update(b"path\0");
                hasher.update(path.to_string_lossy().as_bytes());
            }
            Self::Bytes(bytes) => {
                hasher.update(b"bytes\0");
                hasher.update(bytes);
            }
        }
        hasher.update(b"\0");
        hasher.update(options.to_json().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

/// Static metadata fixed at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMetadata {
    /// Output vector length.
    pub dimensions: usize,
    /// Maximum input tokens, implicit start/end tokens included.
    pub context_window: usize,
    pub pooling_type: PoolingType,
    /// Artifact size in bytes, when the backend knows it.
    pub size_bytes: Option<u64>,
}

/// What a loader hands back: an initialized backend plus its metadata.
pub struct LoadedModel {
    pub backend: Box<dyn ModelBackend>,
    pub metadata: ModelMetadata,
}

/// Turns artifacts into initialized backends.
///
/// Implementations parse the artifact, build tokenizer and inference state
/// and apply whichever options they honor. The registry picks the first loader
/// whose [`accepts`](ModelLoader::accepts) returns true.
pub trait ModelLoader: Send + Sync {
    /// Backend identifier used in logs and error messages.
    fn name(&self) -> &str;

    /// Whether this loader understands the given artifact.
    fn accepts(&self, source: &ModelSource) -> bool;

    /// Option keys this loader honors. Any other key set on a load request
    /// fails the load.
    fn supported_options(&self) -> &[OptionKey];

    fn load(&self, source: &ModelSource, options: &ModelOptions) -> Result<LoadedModel, String>;
}

/// A loaded embedding model.
pub struct Model {
    fingerprint: String,
    source: String,
    backend_name: String,
    metadata: ModelMetadata,
    options: ModelOptions,
    backend: Mutex<Box<dyn ModelBackend>>,
}

impl Model {
    /// Load `source` with `loader`, validating `options` against what the
    /// loader honors before doing any work.
    pub fn load(
        loader: &dyn ModelLoader,
        source: &ModelSource,
        options: &ModelOptions,
    ) -> Result<Self, EmbedError> {
        options
            .validate()
            .map_err(|e| EmbedError::ModelLoad(e.to_string()))?;
        let supported = loader.supported_options();
        if let Some(key) = options
            .set_keys()
            .into_iter()
            .find(|key| !supported.contains(key))
        {
            let names: Vec<&str> = supported.iter().map(OptionKey::as_str).collect();
            return Err(EmbedError::ModelLoad(format!(
                "option '{key}' is not supported by the {} backend (supported: {})",
                loader.name(),
                if names.is_empty() { "none".to_string() } else { names.join(", ") }
            )));
        }

        let started = Instant::now();
        let loaded = loader
            .load(source, options)
            .map_err(|e| EmbedError::ModelLoad(format!("{source}: {e}")))?;

        let metadata = loaded.metadata;
        if metadata.dimensions == 0 {
            return Err(EmbedError::ModelLoad(format!(
                "{source}: model reports zero dimensions"
            )));
        }
        if metadata.context_window == 0 {
            return Err(EmbedError::ModelLoad(format!(
                "{source}: model reports a zero context window"
            )));
        }

        log::info!(
            "loaded model {source} with {} backend in {:?} ({} dims, n_ctx {}, pooling {})",
            loader.name(),
            started.elapsed(),
            metadata.dimensions,
            metadata.context_window,
            metadata.pooling_type
        );

        Ok(Self {
            fingerprint: source.fingerprint(options),
            source: source.to_string(),
            backend_name: loaded.backend.backend_name().to_string(),
            metadata,
            options: options.clone(),
            backend: Mutex::new(loaded.backend),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.metadata.dimensions
    }

    pub fn context_window(&self) -> usize {
        self.metadata.context_window
    }

    pub fn pooling_type(&self) -> PoolingType {
        self.metadata.pooling_type
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.metadata.size_bytes
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Opaque handle string identifying this model within its session.
    pub fn handle(&self) -> String {
        format!("{HANDLE_PREFIX}{}", self.fingerprint)
    }

    /// Human-readable artifact description (path or byte count).
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    /// Run `f` with exclusive access to the backend.
    pub fn with_backend<R>(
        &self,
        f: impl FnOnce(&mut dyn ModelBackend) -> R,
    ) -> Result<R, EmbedError> {
        let mut backend = self
            .backend
            .lock()
            .map_err(|_| EmbedError::Inference("model backend is unavailable".into()))?;
        Ok(f(&mut **backend))
    }

    /// Tokenize `text` including implicit tokens.
    pub fn tokenize(&self, text: &str) -> Result<Vec<Token>, EmbedError> {
        self.with_backend(|backend| backend.tokenize(text))?
            .map_err(|e| EmbedError::Inference(format!("tokenization failed: {e}")))
    }

    pub fn token_to_piece(&self, id: TokenId) -> Result<Option<String>, EmbedError> {
        self.with_backend(|backend| backend.token_to_piece(id))
    }

    pub fn token_score(&self, id: TokenId) -> Result<Option<f32>, EmbedError> {
        self.with_backend(|backend| backend.token_score(id))
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("source", &self.source)
            .field("backend", &self.backend_name)
            .field("metadata", &self.metadata)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        log::debug!("releasing model {} ({})", self.source, self.backend_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_depends_on_source_and_options() {
        let a = ModelSource::path("models/a.toml");
        let b = ModelSource::path("models/b.toml");
        let defaults = ModelOptions::default();
        let short = ModelOptions {
            n_ctx: Some(64),
            ..Default::default()
        };

        assert_eq!(a.fingerprint(&defaults), a.fingerprint(&defaults));
        assert_ne!(a.fingerprint(&defaults), b.fingerprint(&defaults));
        assert_ne!(a.fingerprint(&defaults), a.fingerprint(&short));
        assert_eq!(a.fingerprint(&defaults).len(), 64);
    }

    #[test]
    fn path_and_bytes_with_same_text_differ() {
        let options = ModelOptions::default();
        let path = ModelSource::path("abc");
        let bytes = ModelSource::Bytes(b"abc".to_vec());
        assert_ne!(path.fingerprint(&options), bytes.fingerprint(&options));
    }

    #[test]
    fn source_display_hides_blob_contents() {
        assert_eq!(ModelSource::Bytes(vec![0; 10]).to_string(), "<10 bytes>");
        assert_eq!(ModelSource::path("x/y.toml").to_string(), "x/y.toml");
    }
}
