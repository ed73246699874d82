//! Chunk and batch enumeration.
//!
//! Both plans are computed up front from cheap data (token windows, input
//! strings) and produce embeddings lazily, one row at a time. Iteration is
//! restartable: each call to `iter` starts again at row 0. The first failing
//! row ends the iteration.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::embedding::{EmbedError, Embedding, engine};
use crate::model::Model;

/// Errors raised while planning an enumeration.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkError {
    InvalidOptions(String),
    InvalidInput(String),
    Embed(EmbedError),
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOptions(msg) => write!(f, "invalid chunk options: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid batch input: {msg}"),
            Self::Embed(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ChunkError {}

impl From<EmbedError> for ChunkError {
    fn from(e: EmbedError) -> Self {
        Self::Embed(e)
    }
}

/// Windowing parameters, in content tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOptions {
    /// Tokens per chunk. `None` fills the model's context window.
    pub chunk_size: Option<usize>,
    /// Tokens shared between consecutive chunks.
    pub overlap: usize,
}

impl ChunkOptions {
    /// Effective chunk size for `model`, after validation.
    fn resolve(&self, model: &Model) -> Result<usize, ChunkError> {
        let chunk_size = match self.chunk_size {
            Some(size) => size,
            None => {
                let implicit = model.tokenize("")?.len();
                model.context_window().saturating_sub(implicit)
            }
        };
        if chunk_size == 0 {
            return Err(ChunkError::InvalidOptions(
                "chunk_size must be a positive integer".into(),
            ));
        }
        if self.overlap >= chunk_size {
            return Err(ChunkError::InvalidOptions(format!(
                "overlap ({}) must be smaller than chunk_size ({chunk_size})",
                self.overlap
            )));
        }
        Ok(chunk_size)
    }
}

/// One enumerated chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub index: usize,
    pub text: String,
    /// Content tokens in the window.
    pub token_count: usize,
    pub embedding: Embedding,
}

#[derive(Debug, Clone)]
struct Window {
    bytes: Range<usize>,
    token_count: usize,
}

/// Token windows over one input text.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    model: Arc<Model>,
    text: String,
    windows: Vec<Window>,
}

impl ChunkPlan {
    /// Tokenize `text` once and cut its content tokens into windows.
    pub fn new(model: Arc<Model>, text: String, options: &ChunkOptions) -> Result<Self, ChunkError> {
        let chunk_size = options.resolve(&model)?;
        let stride = chunk_size - options.overlap;

        let tokens = model.tokenize(&text)?;
        let content: Vec<&Range<usize>> = tokens
            .iter()
            .filter(|t| !t.special)
            .map(|t| &t.span)
            .collect();

        let mut windows = Vec::new();
        let mut start = 0;
        while start < content.len() {
            let end = (start + chunk_size).min(content.len());
            windows.push(Window {
                bytes: content[start].start..content[end - 1].end,
                token_count: end - start,
            });
            if end == content.len() {
                break;
            }
            start += stride;
        }

        log::debug!(
            "planned {} chunks of up to {chunk_size} tokens (overlap {}) over {} tokens",
            windows.len(),
            options.overlap,
            content.len()
        );
        Ok(Self {
            model,
            text,
            windows,
        })
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Text of chunk `index`, without embedding it.
    pub fn chunk_text(&self, index: usize) -> Option<&str> {
        self.windows
            .get(index)
            .map(|w| &self.text[w.bytes.clone()])
    }

    /// Embed chunk `index`. `None` past the end.
    pub fn row(&self, index: usize) -> Option<Result<ChunkRow, EmbedError>> {
        let window = self.windows.get(index)?;
        let text = &self.text[window.bytes.clone()];
        Some(engine::embed(&self.model, text).map(|embedding| ChunkRow {
            index,
            text: text.to_string(),
            token_count: window.token_count,
            embedding,
        }))
    }

    pub fn iter(&self) -> Rows<'_, Self> {
        Rows::new(self)
    }
}

/// One enumerated batch element.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    pub index: usize,
    pub text: String,
    pub embedding: Embedding,
}

/// A pre-split list of texts, embedded in input order.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    model: Arc<Model>,
    texts: Vec<String>,
}

impl BatchPlan {
    pub fn new(model: Arc<Model>, texts: Vec<String>) -> Self {
        Self { model, texts }
    }

    /// Build a plan from a JSON array of strings.
    pub fn from_json(model: Arc<Model>, json: &str) -> Result<Self, ChunkError> {
        let texts: Vec<String> = serde_json::from_str(json)
            .map_err(|e| ChunkError::InvalidInput(format!("expected a JSON array of strings: {e}")))?;
        Ok(Self::new(model, texts))
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    pub fn text(&self, index: usize) -> Option<&str> {
        self.texts.get(index).map(String::as_str)
    }

    pub fn row(&self, index: usize) -> Option<Result<BatchRow, EmbedError>> {
        let text = self.texts.get(index)?;
        Some(engine::embed(&self.model, text).map(|embedding| BatchRow {
            index,
            text: text.clone(),
            embedding,
        }))
    }

    pub fn iter(&self) -> Rows<'_, Self> {
        Rows::new(self)
    }
}

/// Random access to lazily computed rows.
pub trait RowSource {
    type Row;

    fn row_at(&self, index: usize) -> Option<Result<Self::Row, EmbedError>>;
}

impl RowSource for ChunkPlan {
    type Row = ChunkRow;

    fn row_at(&self, index: usize) -> Option<Result<ChunkRow, EmbedError>> {
        self.row(index)
    }
}

impl RowSource for BatchPlan {
    type Row = BatchRow;

    fn row_at(&self, index: usize) -> Option<Result<BatchRow, EmbedError>> {
        self.row(index)
    }
}

/// Lazy row iterator. Fused after the first error.
pub struct Rows<'a, S> {
    source: &'a S,
    next: usize,
    done: bool,
}

impl<'a, S> Rows<'a, S> {
    fn new(source: &'a S) -> Self {
        Self {
            source,
            next: 0,
            done: false,
        }
    }
}

impl<S: RowSource> Iterator for Rows<'_, S> {
    type Item = Result<S::Row, EmbedError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.source.row_at(self.next);
        match &item {
            Some(Ok(_)) => self.next += 1,
            Some(Err(_)) | None => self.done = true,
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::hashing::HashingLoader;
    use crate::options::ModelOptions;
    use crate::registry::ModelRegistry;
    use crate::testutil::TempCard;

    fn model(context_window: usize) -> (TempCard, Arc<Model>) {
        let card = TempCard::new(8, context_window, "mean");
        let mut registry = ModelRegistry::new("test");
        registry.add_loader(Box::new(HashingLoader));
        let model = registry.load(&card.source(), &ModelOptions::default()).unwrap();
        (card, model)
    }

    #[test]
    fn windows_advance_by_stride_and_keep_exact_text() {
        let (_card, model) = model(64);
        let options = ChunkOptions {
            chunk_size: Some(3),
            overlap: 1,
        };
        let plan = ChunkPlan::new(model, "one two three four five six".into(), &options).unwrap();

        let texts: Vec<_> = (0..plan.len()).map(|i| plan.chunk_text(i).unwrap()).collect();
        assert_eq!(texts, vec!["one two three", "three four five", "five six"]);
    }

    #[test]
    fn rows_match_standalone_embeddings_in_order() {
        let (_card, model) = model(64);
        let options = ChunkOptions {
            chunk_size: Some(2),
            overlap: 0,
        };
        let plan = ChunkPlan::new(Arc::clone(&model), "a b c d e".into(), &options).unwrap();

        let rows: Vec<ChunkRow> = plan.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 3);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.index, i);
            assert_eq!(row.embedding, engine::embed(&model, &row.text).unwrap());
        }
        assert_eq!(rows[2].token_count, 1);
    }

    #[test]
    fn iteration_restarts_from_zero() {
        let (_card, model) = model(64);
        let options = ChunkOptions {
            chunk_size: Some(1),
            overlap: 0,
        };
        let plan = ChunkPlan::new(model, "x y".into(), &options).unwrap();
        assert_eq!(plan.iter().count(), 2);
        assert_eq!(plan.iter().next().unwrap().unwrap().index, 0);
    }

    #[test]
    fn default_chunk_size_leaves_room_for_implicit_tokens() {
        let (_card, model) = model(4);
        let plan = ChunkPlan::new(model, "a b c d e".into(), &ChunkOptions::default()).unwrap();
        // 4 - [CLS] - [SEP] = 2 content tokens per chunk.
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|row| row.is_ok()));
    }

    #[test]
    fn whitespace_input_yields_no_rows() {
        let (_card, model) = model(64);
        let plan = ChunkPlan::new(model, "   ".into(), &ChunkOptions::default()).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.iter().count(), 0);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let (_card, model) = model(64);
        let options = ChunkOptions {
            chunk_size: Some(2),
            overlap: 2,
        };
        let err = ChunkPlan::new(model, "a b c".into(), &options).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid chunk options: overlap (2) must be smaller than chunk_size (2)"
        );
    }

    #[test]
    fn oversized_chunk_aborts_enumeration() {
        let (_card, model) = model(4);
        let options = ChunkOptions {
            chunk_size: Some(3),
            overlap: 0,
        };
        let plan = ChunkPlan::new(model, "a b c d e f".into(), &options).unwrap();
        let mut rows = plan.iter();
        let err = rows.next().unwrap().unwrap_err();
        assert_eq!(
            err,
            EmbedError::InputTooLong {
                tokens: 5,
                context_window: 4
            }
        );
        assert!(rows.next().is_none());
    }

    #[test]
    fn batch_rows_follow_input_order() {
        let (_card, model) = model(64);
        let plan = BatchPlan::from_json(Arc::clone(&model), r#"["alpha", "beta gamma"]"#).unwrap();
        let rows: Vec<BatchRow> = plan.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].text, "beta gamma");
        assert_eq!(rows[0].embedding, engine::embed(&model, "alpha").unwrap());
    }

    #[test]
    fn batch_input_must_be_string_array() {
        let (_card, model) = model(64);
        let err = BatchPlan::from_json(model, r#"{"a": 1}"#).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidInput(_)));
    }
}
