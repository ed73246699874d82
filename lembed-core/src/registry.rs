//! Per-session model registry.
//!
//! Entries bind a name (or the default slot) to a loaded [`Model`]. The
//! registry also owns the session's load cache, so loading the same artifact
//! with the same options twice hands back the model already in memory.

use std::collections::HashMap;
use std::sync::Arc;

use crate::embedding::hashing::HashingLoader;
use crate::embedding::local::FastembedLoader;
use crate::embedding::{EmbedError, Embedding, engine};
use crate::model::{HANDLE_PREFIX, Model, ModelLoader, ModelSource};
use crate::options::{ModelOptions, PoolingType};

/// Name used in error messages when none is configured.
pub const DEFAULT_REGISTRY_NAME: &str = "lembed_models";

/// Entry name that, like a null name, denotes the default slot.
pub const DEFAULT_MODEL_NAME: &str = "default";

/// Whether `name` addresses the default slot.
pub fn is_default_name(name: Option<&str>) -> bool {
    match name {
        None => true,
        Some(name) => name.is_empty() || name == DEFAULT_MODEL_NAME,
    }
}

/// What gets bound to a registry entry.
#[derive(Debug, Clone)]
pub enum ModelRef {
    /// A model that is already loaded.
    Loaded(Arc<Model>),
    /// An artifact to load on insert.
    Source(ModelSource, ModelOptions),
}

impl From<Arc<Model>> for ModelRef {
    fn from(model: Arc<Model>) -> Self {
        Self::Loaded(model)
    }
}

impl From<ModelSource> for ModelRef {
    fn from(source: ModelSource) -> Self {
        Self::Source(source, ModelOptions::default())
    }
}

/// A single named (or default) binding.
#[derive(Debug)]
pub struct RegistryEntry {
    rowid: i64,
    name: Option<String>,
    model: Arc<Model>,
}

impl RegistryEntry {
    pub fn rowid(&self) -> i64 {
        self.rowid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn is_default(&self) -> bool {
        is_default_name(self.name.as_deref())
    }
}

/// Read-only projection of an entry for introspection. Never carries the
/// model itself.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub rowid: i64,
    pub name: Option<String>,
    pub dimensions: usize,
    pub context_window: usize,
    pub pooling_type: PoolingType,
    pub options: ModelOptions,
}

/// One embedding call: an optional model name and the text to embed.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRequest {
    pub model_name: Option<String>,
    pub text: String,
}

impl EmbeddingRequest {
    pub fn new(model_name: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            model_name: model_name.map(str::to_string),
            text: text.into(),
        }
    }
}

pub struct ModelRegistry {
    name: String,
    loaders: Vec<Box<dyn ModelLoader>>,
    entries: Vec<RegistryEntry>,
    next_rowid: i64,
    /// Loaded models by fingerprint.
    loaded: HashMap<String, Arc<Model>>,
}

impl ModelRegistry {
    /// Create an empty registry with no loaders.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            loaders: Vec::new(),
            entries: Vec::new(),
            next_rowid: 1,
            loaded: HashMap::new(),
        }
    }

    /// Create a registry with the hashing and fastembed loaders installed.
    pub fn with_default_loaders(name: impl Into<String>, fastembed: FastembedLoader) -> Self {
        let mut registry = Self::new(name);
        registry.add_loader(Box::new(HashingLoader));
        registry.add_loader(Box::new(fastembed));
        registry
    }

    /// Install a loader. Loaders are tried in insertion order.
    pub fn add_loader(&mut self, loader: Box<dyn ModelLoader>) {
        self.loaders.push(loader);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    /// Load `source` with `options`, or return the model already loaded from
    /// the same artifact with the same options in this session.
    pub fn load(
        &mut self,
        source: &ModelSource,
        options: &ModelOptions,
    ) -> Result<Arc<Model>, EmbedError> {
        let fingerprint = source.fingerprint(options);
        if let Some(model) = self.loaded.get(&fingerprint) {
            log::debug!("load cache hit for {source}");
            return Ok(Arc::clone(model));
        }

        let loader = self
            .loaders
            .iter()
            .find(|loader| loader.accepts(source))
            .ok_or_else(|| {
                EmbedError::ModelLoad(format!("{source}: no backend recognizes this model artifact"))
            })?;
        let model = Arc::new(Model::load(loader.as_ref(), source, options)?);
        self.loaded.insert(fingerprint, Arc::clone(&model));
        Ok(model)
    }

    /// Look up a model previously returned by [`load`](Self::load) through its
    /// handle string.
    pub fn model_by_handle(&self, handle: &str) -> Option<Arc<Model>> {
        let fingerprint = handle.strip_prefix(HANDLE_PREFIX)?;
        self.loaded.get(fingerprint).cloned()
    }

    /// Bind `model` to `name`, loading it first when given a source.
    ///
    /// A null, empty or `"default"` name targets the default slot and replaces
    /// whatever occupied it. Any other name must be unused. Returns the new
    /// entry's rowid.
    pub fn register(&mut self, name: Option<&str>, model: ModelRef) -> Result<i64, EmbedError> {
        let is_default = is_default_name(name);
        if !is_default {
            if let Some(name) = name.filter(|n| self.find_named(n).is_some()) {
                return Err(EmbedError::DuplicateName {
                    name: name.to_string(),
                    registry: self.name.clone(),
                });
            }
        }

        let model = match model {
            ModelRef::Loaded(model) => model,
            ModelRef::Source(source, options) => self.load(&source, &options)?,
        };

        let previous_default = if is_default {
            self.entries.iter().position(RegistryEntry::is_default)
        } else {
            None
        };
        let replaced = previous_default.map(|position| self.entries.remove(position));

        let rowid = self.next_rowid;
        self.next_rowid += 1;
        log::info!(
            "registered model {} as '{}' with {}",
            model.source(),
            name.unwrap_or(DEFAULT_MODEL_NAME),
            self.name
        );
        self.entries.push(RegistryEntry {
            rowid,
            name: name.map(str::to_string),
            model,
        });

        if let Some(previous) = replaced {
            log::info!("replaced previous default model {}", previous.model.source());
            self.evict_if_unused(&previous.model);
        }
        Ok(rowid)
    }

    /// Resolve a model by entry name. `None`, `""` and `"default"` resolve
    /// the default slot.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<Model>, EmbedError> {
        if is_default_name(name) {
            return self
                .entries
                .iter()
                .find(|entry| entry.is_default())
                .map(|entry| Arc::clone(&entry.model))
                .ok_or_else(|| EmbedError::NoDefaultModel {
                    registry: self.name.clone(),
                });
        }

        let name = name.unwrap_or_default();
        self.find_named(name)
            .map(|entry| Arc::clone(&entry.model))
            .ok_or_else(|| EmbedError::UnknownModel {
                name: name.to_string(),
                registry: self.name.clone(),
            })
    }

    /// Resolve either a handle string or an entry name.
    pub fn resolve_reference(&self, reference: Option<&str>) -> Result<Arc<Model>, EmbedError> {
        match reference {
            Some(handle) if handle.starts_with(HANDLE_PREFIX) => {
                self.model_by_handle(handle)
                    .ok_or_else(|| EmbedError::UnknownModel {
                        name: handle.to_string(),
                        registry: self.name.clone(),
                    })
            }
            other => self.resolve(other),
        }
    }

    /// Introspection rows in registration order.
    pub fn list(&self) -> Vec<EntryInfo> {
        self.entries
            .iter()
            .map(|entry| EntryInfo {
                rowid: entry.rowid,
                name: entry.name.clone(),
                dimensions: entry.model.dimensions(),
                context_window: entry.model.context_window(),
                pooling_type: entry.model.pooling_type(),
                options: entry.model.options().clone(),
            })
            .collect()
    }

    /// Evict the entry with `rowid`. Returns false if there was none.
    pub fn remove(&mut self, rowid: i64) -> bool {
        let Some(position) = self.entries.iter().position(|e| e.rowid == rowid) else {
            return false;
        };
        let entry = self.entries.remove(position);
        log::info!(
            "removed model '{}' from {}",
            entry.name.as_deref().unwrap_or(DEFAULT_MODEL_NAME),
            self.name
        );
        self.evict_if_unused(&entry.model);
        true
    }

    /// Evict every entry and every loaded model.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() || !self.loaded.is_empty() {
            log::debug!(
                "clearing {}: {} entries, {} loaded models",
                self.name,
                self.entries.len(),
                self.loaded.len()
            );
        }
        self.entries.clear();
        self.loaded.clear();
    }

    /// Resolve the request's model and embed its text.
    pub fn embed(&self, request: &EmbeddingRequest) -> Result<Embedding, EmbedError> {
        let model = self.resolve(request.model_name.as_deref())?;
        engine::embed(&model, &request.text)
    }

    fn find_named(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries
            .iter()
            .find(|entry| !entry.is_default() && entry.name.as_deref() == Some(name))
    }

    /// Drop `model` from the load cache once no entry refers to it.
    fn evict_if_unused(&mut self, model: &Arc<Model>) {
        let in_use = self
            .entries
            .iter()
            .any(|entry| entry.model.fingerprint() == model.fingerprint());
        if !in_use {
            self.loaded.remove(model.fingerprint());
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_default_loaders(DEFAULT_REGISTRY_NAME, FastembedLoader::default())
    }
}

impl Drop for ModelRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TempCard;

    fn registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new(DEFAULT_REGISTRY_NAME);
        registry.add_loader(Box::new(HashingLoader));
        registry
    }

    #[test]
    fn resolve_null_uses_entry_named_default() {
        let card = TempCard::new(384, 512, "mean");
        let mut registry = registry();
        registry.register(Some("default"), card.source().into()).unwrap();

        let model = registry.resolve(None).unwrap();
        assert_eq!(model.dimensions(), 384);
        assert_eq!(registry.resolve(Some("default")).unwrap().fingerprint(), model.fingerprint());
    }

    #[test]
    fn resolve_null_without_default_fails() {
        let card = TempCard::new(384, 512, "mean");
        let mut registry = registry();
        registry.register(Some("named"), card.source().into()).unwrap();

        let err = registry.resolve(None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "No default model has been registered yet with lembed_models"
        );
    }

    #[test]
    fn resolve_unknown_name_fails() {
        let registry = registry();
        let err = registry.resolve(Some("aaaaaaaaa")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown model name 'aaaaaaaaa'. Was it registered with lembed_models?"
        );
    }

    #[test]
    fn duplicate_name_fails_before_loading() {
        let card = TempCard::new(8, 32, "mean");
        let mut registry = registry();
        registry.register(Some("aaa"), card.source().into()).unwrap();

        let missing = ModelSource::path("does/not/exist.toml");
        let err = registry.register(Some("aaa"), missing.into()).unwrap_err();
        assert_eq!(
            err,
            EmbedError::DuplicateName {
                name: "aaa".into(),
                registry: DEFAULT_REGISTRY_NAME.into()
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn null_name_and_default_share_one_slot() {
        let small = TempCard::new(8, 32, "mean");
        let large = TempCard::new(16, 32, "mean");
        let mut registry = registry();
        registry.register(None, small.source().into()).unwrap();
        registry.register(Some("default"), large.source().into()).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve(None).unwrap().dimensions(), 16);
    }

    #[test]
    fn register_then_resolve_sees_new_entry() {
        let card = TempCard::new(8, 32, "cls");
        let mut registry = registry();
        registry.register(Some("fresh"), card.source().into()).unwrap();
        assert_eq!(registry.resolve(Some("fresh")).unwrap().pooling_type(), PoolingType::Cls);
    }

    #[test]
    fn load_failure_leaves_registry_usable() {
        let card = TempCard::new(8, 32, "mean");
        let mut registry = registry();
        let err = registry
            .register(Some("broken"), ModelSource::path("missing.toml").into())
            .unwrap_err();
        assert!(matches!(err, EmbedError::ModelLoad(_)));
        assert!(registry.is_empty());

        registry.register(Some("broken"), card.source().into()).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unrecognized_artifact_is_a_load_error() {
        let mut registry = registry();
        let err = registry
            .load(&ModelSource::path("weights.bin"), &ModelOptions::default())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error loading model: weights.bin: no backend recognizes this model artifact"
        );
    }

    #[test]
    fn unsupported_option_fails_the_load() {
        let card = TempCard::new(8, 32, "mean");
        let mut registry = registry();
        let options = ModelOptions {
            n_gpu_layers: Some(4),
            ..Default::default()
        };
        let err = registry.load(&card.source(), &options).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error loading model: option 'n_gpu_layers' is not supported by the hashing backend \
             (supported: n_ctx, pooling_type, normalize, seed)"
        );
    }

    #[test]
    fn repeated_load_reuses_model() {
        let card = TempCard::new(8, 32, "mean");
        let mut registry = registry();
        let first = registry.load(&card.source(), &ModelOptions::default()).unwrap();
        let second = registry.load(&card.source(), &ModelOptions::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let handle = first.handle();
        assert!(Arc::ptr_eq(&registry.model_by_handle(&handle).unwrap(), &first));
    }

    #[test]
    fn list_reflects_entries_in_registration_order() {
        let a = TempCard::new(384, 512, "none");
        let b = TempCard::new(768, 256, "mean");
        let mut registry = registry();
        registry.register(Some("b"), b.source().into()).unwrap();
        registry.register(Some("a"), a.source().into()).unwrap();

        let rows = registry.list();
        let names: Vec<_> = rows.iter().map(|r| r.name.as_deref()).collect();
        assert_eq!(names, vec![Some("b"), Some("a")]);
        assert_eq!(rows[0].dimensions, 768);
        assert_eq!(rows[0].context_window, 256);
        assert_eq!(rows[1].pooling_type, PoolingType::None);
        assert!(rows[0].rowid < rows[1].rowid);
    }

    #[test]
    fn remove_evicts_entry_and_cached_model() {
        let card = TempCard::new(8, 32, "mean");
        let mut registry = registry();
        let rowid = registry.register(Some("gone"), card.source().into()).unwrap();
        let handle = registry.resolve(Some("gone")).unwrap().handle();

        assert!(registry.remove(rowid));
        assert!(!registry.remove(rowid));
        assert!(registry.resolve(Some("gone")).is_err());
        assert!(registry.model_by_handle(&handle).is_none());
    }

    #[test]
    fn embed_request_uses_resolved_model() {
        let card = TempCard::new(12, 32, "mean");
        let mut registry = registry();
        registry.register(None, card.source().into()).unwrap();

        let embedding = registry
            .embed(&EmbeddingRequest::new(None, "alex garcia"))
            .unwrap();
        assert_eq!(embedding.to_bytes().len(), 4 * 12);
    }
}
