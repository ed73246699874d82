//! Helpers for tests that need real, download-free models.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::model::ModelSource;

static NEXT_CARD: AtomicUsize = AtomicUsize::new(0);

/// Card text for a hashing model.
pub fn hashing_card(dimensions: usize, context_window: usize, pooling: &str) -> String {
    format!(
        "[hashing]\ndimensions = {dimensions}\ncontext_window = {context_window}\npooling = \"{pooling}\"\n"
    )
}

/// A hashing model card written to the temp directory, removed on drop.
#[derive(Debug)]
pub struct TempCard {
    path: PathBuf,
}

impl TempCard {
    pub fn new(dimensions: usize, context_window: usize, pooling: &str) -> Self {
        Self::with_contents(&hashing_card(dimensions, context_window, pooling))
    }

    pub fn with_contents(contents: &str) -> Self {
        let n = NEXT_CARD.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "lembed-card-{}-{n}.toml",
            std::process::id()
        ));
        if let Err(e) = std::fs::write(&path, contents) {
            panic!("failed to write model card '{}': {e}", path.display());
        }
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path as UTF-8 text, the way SQL callers pass it.
    pub fn path_str(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn source(&self) -> ModelSource {
        ModelSource::Path(self.path.clone())
    }
}

impl Drop for TempCard {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}
