use std::path::PathBuf;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::{HiddenStates, InferenceAdapter, ModelBackend, Token, TokenBatch, TokenId, TokenizerAdapter};
use crate::model::{LoadedModel, ModelLoader, ModelMetadata, ModelSource};
use crate::options::{ModelOptions, OptionKey, PoolingType};

// fastembed L2-normalizes every pooled vector itself, so `normalize` cannot be
// turned off here.
const SUPPORTED_OPTIONS: &[OptionKey] = &[OptionKey::NCtx];

/// A model fastembed can fetch and run with ONNX runtime.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub model: EmbeddingModel,
    pub dimensions: usize,
    pub pooling_type: PoolingType,
    pub context_window: usize,
}

pub const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        name: "all-MiniLM-L6-v2",
        model: EmbeddingModel::AllMiniLML6V2,
        dimensions: 384,
        pooling_type: PoolingType::Mean,
        context_window: 512,
    },
    CatalogEntry {
        name: "bge-small-en-v1.5",
        model: EmbeddingModel::BGESmallENV15,
        dimensions: 384,
        pooling_type: PoolingType::Cls,
        context_window: 512,
    },
    CatalogEntry {
        name: "bge-base-en-v1.5",
        model: EmbeddingModel::BGEBaseENV15,
        dimensions: 768,
        pooling_type: PoolingType::Cls,
        context_window: 512,
    },
    CatalogEntry {
        name: "bge-large-en-v1.5",
        model: EmbeddingModel::BGELargeENV15,
        dimensions: 1024,
        pooling_type: PoolingType::Cls,
        context_window: 512,
    },
    CatalogEntry {
        name: "nomic-embed-text-v1.5",
        model: EmbeddingModel::NomicEmbedTextV15,
        dimensions: 768,
        pooling_type: PoolingType::Mean,
        context_window: 8192,
    },
];

/// Find a catalog entry by name, ignoring case and an optional
/// `sentence-transformers/` or `BAAI/` style organization prefix.
pub fn find_catalog_entry(name: &str) -> Option<&'static CatalogEntry> {
    let bare = name.rsplit('/').next().unwrap_or(name);
    CATALOG.iter().find(|entry| entry.name.eq_ignore_ascii_case(bare))
}

/// Loads catalog models through fastembed, downloading on first use.
#[derive(Debug, Clone, Default)]
pub struct FastembedLoader {
    pub cache_dir: Option<PathBuf>,
    pub show_download_progress: bool,
}

impl FastembedLoader {
    pub fn new(cache_dir: Option<PathBuf>, show_download_progress: bool) -> Self {
        Self {
            cache_dir,
            show_download_progress,
        }
    }
}

impl ModelLoader for FastembedLoader {
    fn name(&self) -> &str {
        "fastembed"
    }

    fn accepts(&self, source: &ModelSource) -> bool {
        match source {
            ModelSource::Path(path) => path.to_str().is_some_and(|s| find_catalog_entry(s).is_some()),
            ModelSource::Bytes(_) => false,
        }
    }

    fn supported_options(&self) -> &[OptionKey] {
        SUPPORTED_OPTIONS
    }

    fn load(&self, source: &ModelSource, options: &ModelOptions) -> Result<LoadedModel, String> {
        let entry = match source {
            ModelSource::Path(path) => path.to_str().and_then(find_catalog_entry),
            ModelSource::Bytes(_) => None,
        }
        .ok_or_else(|| "not a fastembed catalog model".to_string())?;

        let context_window = options.n_ctx.map_or(entry.context_window, |n| n as usize);
        let mut init = InitOptions::new(entry.model.clone())
            .with_show_download_progress(self.show_download_progress)
            .with_max_length(context_window);
        if let Some(dir) = &self.cache_dir {
            init = init.with_cache_dir(dir.clone());
        }

        let mut model = TextEmbedding::try_new(init).map_err(|e| e.to_string())?;
        // Length is enforced against the context window before inference, so
        // the tokenizer must report every token instead of silently cutting.
        model
            .tokenizer
            .with_truncation(None)
            .map_err(|e| e.to_string())?;

        Ok(LoadedModel {
            backend: Box::new(FastembedBackend { model }),
            metadata: ModelMetadata {
                dimensions: entry.dimensions,
                context_window,
                pooling_type: entry.pooling_type,
                size_bytes: None,
            },
        })
    }
}

/// Local embedding backend using fastembed with ONNX runtime.
pub struct FastembedBackend {
    model: TextEmbedding,
}

impl TokenizerAdapter for FastembedBackend {
    fn tokenize(&self, text: &str) -> Result<Vec<Token>, String> {
        let encoding = self
            .model
            .tokenizer
            .encode(text, true)
            .map_err(|e| e.to_string())?;

        let tokens = encoding
            .get_ids()
            .iter()
            .zip(encoding.get_offsets())
            .zip(encoding.get_special_tokens_mask())
            .zip(encoding.get_attention_mask())
            .filter(|(_, attention)| **attention != 0)
            .map(|(((&id, &(start, end)), &special), _)| Token {
                id,
                special: special != 0,
                span: if special != 0 { start..start } else { start..end },
            })
            .collect();
        Ok(tokens)
    }

    fn token_to_piece(&self, id: TokenId) -> Option<String> {
        self.model.tokenizer.id_to_token(id)
    }

    fn token_score(&self, _id: TokenId) -> Option<f32> {
        None
    }
}

impl InferenceAdapter for FastembedBackend {
    fn infer(&mut self, batch: TokenBatch<'_>) -> Result<HiddenStates, String> {
        let mut vectors = self
            .model
            .embed(vec![batch.text], None)
            .map_err(|e| e.to_string())?;
        let vector = vectors
            .pop()
            .ok_or_else(|| "fastembed returned no vectors".to_string())?;
        Ok(HiddenStates::Pooled(vector))
    }
}

impl ModelBackend for FastembedBackend {
    fn backend_name(&self) -> &str {
        "fastembed"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use super::*;
    use crate::embedding::engine;
    use crate::model::Model;

    /// Shared model instance across tests to avoid parallel download races
    /// and redundant model loads.
    static MINILM: LazyLock<Model> = LazyLock::new(|| {
        Model::load(
            &FastembedLoader::default(),
            &ModelSource::path("all-MiniLM-L6-v2"),
            &ModelOptions::default(),
        )
        .unwrap()
    });

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        dot / (norm_a * norm_b)
    }

    #[test]
    fn catalog_lookup_ignores_case_and_org_prefix() {
        assert_eq!(find_catalog_entry("ALL-minilm-l6-v2").map(|e| e.dimensions), Some(384));
        assert_eq!(
            find_catalog_entry("BAAI/bge-base-en-v1.5").map(|e| e.pooling_type),
            Some(PoolingType::Cls)
        );
        assert!(find_catalog_entry("models/mini.toml").is_none());
    }

    #[test]
    fn loader_rejects_bytes_and_unknown_names() {
        let loader = FastembedLoader::default();
        assert!(!loader.accepts(&ModelSource::Bytes(vec![1, 2, 3])));
        assert!(!loader.accepts(&ModelSource::path("nope")));
        assert!(loader.accepts(&ModelSource::path("nomic-embed-text-v1.5")));
    }

    #[test]
    fn disabling_normalize_fails_before_download() {
        let options = ModelOptions {
            normalize: Some(false),
            ..ModelOptions::default()
        };
        let err = Model::load(
            &FastembedLoader::default(),
            &ModelSource::path("all-MiniLM-L6-v2"),
            &options,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error loading model: option 'normalize' is not supported by the fastembed backend \
             (supported: n_ctx)"
        );
    }

    #[test]
    #[ignore = "downloads model weights"]
    fn output_is_unit_length() {
        let embedding = engine::embed(&MINILM, "alex garcia").unwrap();
        let norm: f32 = embedding.as_slice().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "expected unit norm, got {norm}");
    }

    #[test]
    #[ignore = "downloads model weights"]
    fn embed_known_text_matches_reference_vector() {
        let embedding = engine::embed(&MINILM, "alex garcia").unwrap();
        assert_eq!(embedding.dimensions(), 384);
        assert!((embedding.as_slice()[0] - -0.0920575).abs() < 1e-4);
    }

    #[test]
    #[ignore = "downloads model weights"]
    fn tokenize_includes_special_tokens_with_byte_spans() {
        let text = "alex garcia";
        let tokens = MINILM.tokenize(text).unwrap();
        assert!(tokens.first().unwrap().special);
        assert!(tokens.last().unwrap().special);
        let words: String = tokens
            .iter()
            .filter(|t| !t.special)
            .map(|t| &text[t.span.clone()])
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(words, "alex garcia");
    }

    #[test]
    #[ignore = "downloads model weights"]
    fn similar_texts_have_high_cosine_similarity() {
        let a = engine::embed(&MINILM, "the cat sat on the mat").unwrap();
        let b = engine::embed(&MINILM, "the cat is sitting on the mat").unwrap();
        let sim = cosine_similarity(a.as_slice(), b.as_slice());
        assert!(
            sim > 0.7,
            "expected cosine similarity > 0.7 for similar texts, got {sim}"
        );
    }

    #[test]
    #[ignore = "downloads model weights"]
    fn long_input_is_rejected_not_truncated() {
        let text = "word ".repeat(600);
        let err = engine::embed(&MINILM, &text).unwrap_err();
        assert!(err.to_string().starts_with("Input too long, provided 602 tokens"));
    }
}
