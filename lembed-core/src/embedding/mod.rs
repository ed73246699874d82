pub mod engine;
pub mod hashing;
pub mod local;

use std::fmt;
use std::ops::Range;

/// Token identifier as produced by a tokenizer.
pub type TokenId = u32;

/// Errors surfaced to callers of the registry and the embedding engine.
///
/// The `Display` text of each variant is part of the public contract: hosts
/// pass it through verbatim as their own error message.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedError {
    /// The named model is not in the registry.
    UnknownModel { name: String, registry: String },
    /// No entry occupies the default slot.
    NoDefaultModel { registry: String },
    /// A non-default name is already taken.
    DuplicateName { name: String, registry: String },
    /// The artifact could not be read, parsed or initialized.
    ModelLoad(String),
    /// The tokenized input does not fit the model's context window.
    InputTooLong { tokens: usize, context_window: usize },
    /// The numeric backend failed while computing an embedding.
    Inference(String),
}

impl fmt::Display for EmbedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownModel { name, registry } => write!(
                f,
                "Unknown model name '{name}'. Was it registered with {registry}?"
            ),
            Self::NoDefaultModel { registry } => {
                write!(f, "No default model has been registered yet with {registry}")
            }
            Self::DuplicateName { name, registry } => {
                write!(f, "Model name '{name}' is already registered with {registry}")
            }
            Self::ModelLoad(msg) => write!(f, "Error loading model: {msg}"),
            Self::InputTooLong {
                tokens,
                context_window,
            } => write!(
                f,
                "Input too long, provided {tokens} tokens, but model has context size of {context_window}"
            ),
            Self::Inference(msg) => write!(f, "Error generating embedding: {msg}"),
        }
    }
}

impl std::error::Error for EmbedError {}

/// One token of a tokenized input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: TokenId,
    /// Implicit tokens added by the tokenizer (start/end markers).
    pub special: bool,
    /// Byte range of the source text this token covers. Empty for special
    /// tokens.
    pub span: Range<usize>,
}

/// Text to token conversion for one model.
pub trait TokenizerAdapter {
    /// Tokenize `text`, including the tokenizer's implicit start/end tokens.
    fn tokenize(&self, text: &str) -> Result<Vec<Token>, String>;

    /// Text of a single token, or `None` if the id is out of range.
    fn token_to_piece(&self, id: TokenId) -> Option<String>;

    /// Model-assigned prior score of a token, when the backend exposes one.
    fn token_score(&self, id: TokenId) -> Option<f32>;
}

/// Raw output of one inference call.
#[derive(Debug, Clone, PartialEq)]
pub enum HiddenStates {
    /// One hidden state per input token, in input order.
    PerToken(Vec<Vec<f32>>),
    /// The backend pooled internally.
    Pooled(Vec<f32>),
}

/// A single inference request: the full token sequence of one input.
#[derive(Debug, Clone, Copy)]
pub struct TokenBatch<'a> {
    pub text: &'a str,
    pub tokens: &'a [Token],
}

/// Numeric backend for one model.
pub trait InferenceAdapter {
    fn infer(&mut self, batch: TokenBatch<'_>) -> Result<HiddenStates, String>;
}

/// A loaded tokenizer + inference pair, exclusively owned by one model.
pub trait ModelBackend: TokenizerAdapter + InferenceAdapter + Send {
    /// Short backend identifier (e.g. "fastembed", "hashing").
    fn backend_name(&self) -> &str;
}

/// A fixed-length embedding vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }

    /// Encode as a contiguous little-endian byte buffer of `4 * dimensions`
    /// bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() * 4);
        for &v in &self.0 {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    /// Decode a little-endian byte buffer. Trailing bytes that do not form a
    /// whole float are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(
            bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }
}
