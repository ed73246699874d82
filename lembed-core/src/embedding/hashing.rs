//! Feature-hashing backend.
//!
//! A download-free, fully deterministic model described by a small TOML card:
//!
//! ```toml
//! [hashing]
//! dimensions = 384
//! context_window = 512
//! pooling = "mean"
//! seed = 7
//! ```
//!
//! Words are hashed (FNV-1a) into a fixed vocabulary, each token id expands to
//! a pseudo-random base vector, and every hidden state mixes in the sequence
//! mean plus a sinusoidal position term so that pooling strategies give
//! distinct results.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::Deserialize;

use super::{HiddenStates, InferenceAdapter, ModelBackend, Token, TokenBatch, TokenId, TokenizerAdapter};
use crate::model::{LoadedModel, ModelLoader, ModelMetadata, ModelSource};
use crate::options::{ModelOptions, OptionKey, PoolingType};

const PAD_ID: TokenId = 0;
const CLS_ID: TokenId = 1;
const SEP_ID: TokenId = 2;
const FIRST_WORD_ID: TokenId = 3;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

const POSITION_WEIGHT: f32 = 0.1;

const SUPPORTED_OPTIONS: &[OptionKey] = &[
    OptionKey::NCtx,
    OptionKey::PoolingType,
    OptionKey::Normalize,
    OptionKey::Seed,
];

#[derive(Debug, Deserialize)]
struct CardFile {
    hashing: HashingCard,
}

/// Parameters of a hashing model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HashingCard {
    pub dimensions: usize,
    pub context_window: usize,
    #[serde(default = "default_pooling")]
    pub pooling: PoolingType,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: u32,
    #[serde(default = "default_lowercase")]
    pub lowercase: bool,
}

fn default_pooling() -> PoolingType {
    PoolingType::Mean
}

fn default_vocab_size() -> u32 {
    30522
}

fn default_lowercase() -> bool {
    true
}

impl HashingCard {
    pub fn parse(contents: &str) -> Result<Self, String> {
        let file: CardFile =
            toml::from_str(contents).map_err(|e| format!("invalid model card: {e}"))?;
        let card = file.hashing;
        if card.dimensions == 0 {
            return Err("invalid model card: dimensions must be positive".into());
        }
        if card.context_window == 0 {
            return Err("invalid model card: context_window must be positive".into());
        }
        if card.vocab_size <= FIRST_WORD_ID {
            return Err(format!(
                "invalid model card: vocab_size must be greater than {FIRST_WORD_ID}"
            ));
        }
        Ok(card)
    }
}

/// Loads hashing models from `*.toml` cards or card bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashingLoader;

impl ModelLoader for HashingLoader {
    fn name(&self) -> &str {
        "hashing"
    }

    fn accepts(&self, source: &ModelSource) -> bool {
        match source {
            ModelSource::Path(path) => path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("toml")),
            ModelSource::Bytes(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|text| toml::from_str::<toml::Table>(text).ok())
                .is_some_and(|table| table.contains_key("hashing")),
        }
    }

    fn supported_options(&self) -> &[OptionKey] {
        SUPPORTED_OPTIONS
    }

    fn load(&self, source: &ModelSource, options: &ModelOptions) -> Result<LoadedModel, String> {
        let (contents, size) = match source {
            ModelSource::Path(path) => read_card(path)?,
            ModelSource::Bytes(bytes) => (
                String::from_utf8(bytes.clone()).map_err(|_| "model card is not UTF-8".to_string())?,
                bytes.len() as u64,
            ),
        };
        let mut card = HashingCard::parse(&contents)?;

        if let Some(seed) = options.seed {
            card.seed = u64::from(seed);
        }
        let metadata = ModelMetadata {
            dimensions: card.dimensions,
            context_window: options.n_ctx.map_or(card.context_window, |n| n as usize),
            pooling_type: options.pooling_type.unwrap_or(card.pooling),
            size_bytes: Some(size),
        };

        Ok(LoadedModel {
            backend: Box::new(HashingBackend::new(card)),
            metadata,
        })
    }
}

fn read_card(path: &Path) -> Result<(String, u64), String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read model card '{}': {e}", path.display()))?;
    let size = contents.len() as u64;
    Ok((contents, size))
}

/// Tokenizer and inference state of one hashing model.
pub struct HashingBackend {
    card: HashingCard,
    /// First piece seen for each word id, for `token_to_piece`.
    pieces: Mutex<HashMap<TokenId, String>>,
}

impl HashingBackend {
    pub fn new(card: HashingCard) -> Self {
        Self {
            card,
            pieces: Mutex::new(HashMap::new()),
        }
    }

    fn word_id(&self, word: &str) -> TokenId {
        let hash = if self.card.lowercase {
            fnv1a(word.to_lowercase().as_bytes())
        } else {
            fnv1a(word.as_bytes())
        };
        let buckets = u64::from(self.card.vocab_size - FIRST_WORD_ID);
        FIRST_WORD_ID + (hash % buckets) as TokenId
    }

    fn base_vector(&self, id: TokenId) -> Vec<f32> {
        let key = self.card.seed ^ (u64::from(id) << 32);
        (0..self.card.dimensions)
            .map(|j| unit_float(splitmix64(key.wrapping_add(j as u64))))
            .collect()
    }
}

impl TokenizerAdapter for HashingBackend {
    fn tokenize(&self, text: &str) -> Result<Vec<Token>, String> {
        let mut tokens = vec![Token {
            id: CLS_ID,
            special: true,
            span: 0..0,
        }];
        let mut pieces = self
            .pieces
            .lock()
            .map_err(|_| "tokenizer state is unavailable".to_string())?;

        for span in word_spans(text) {
            let piece = &text[span.clone()];
            let id = self.word_id(piece);
            pieces.entry(id).or_insert_with(|| piece.to_string());
            tokens.push(Token {
                id,
                special: false,
                span,
            });
        }

        tokens.push(Token {
            id: SEP_ID,
            special: true,
            span: text.len()..text.len(),
        });
        Ok(tokens)
    }

    fn token_to_piece(&self, id: TokenId) -> Option<String> {
        match id {
            PAD_ID => Some("[PAD]".into()),
            CLS_ID => Some("[CLS]".into()),
            SEP_ID => Some("[SEP]".into()),
            id if id >= self.card.vocab_size => None,
            id => self.pieces.lock().ok()?.get(&id).cloned(),
        }
    }

    fn token_score(&self, id: TokenId) -> Option<f32> {
        // Uniform prior over the word vocabulary.
        match id {
            PAD_ID | CLS_ID | SEP_ID => Some(0.0),
            id if id >= self.card.vocab_size => None,
            _ => Some(-((self.card.vocab_size - FIRST_WORD_ID) as f32).ln()),
        }
    }
}

impl InferenceAdapter for HashingBackend {
    fn infer(&mut self, batch: TokenBatch<'_>) -> Result<HiddenStates, String> {
        let dims = self.card.dimensions;
        let bases: Vec<Vec<f32>> = batch.tokens.iter().map(|t| self.base_vector(t.id)).collect();
        if bases.is_empty() {
            return Err("empty token batch".into());
        }

        let mut context = vec![0.0f32; dims];
        for base in &bases {
            for (acc, v) in context.iter_mut().zip(base) {
                *acc += v;
            }
        }
        let n = bases.len() as f32;
        context.iter_mut().for_each(|v| *v /= n);

        let states = bases
            .into_iter()
            .enumerate()
            .map(|(position, mut state)| {
                for (j, v) in state.iter_mut().enumerate() {
                    *v += context[j] + POSITION_WEIGHT * position_encoding(position, j, dims);
                }
                state
            })
            .collect();
        Ok(HiddenStates::PerToken(states))
    }
}

impl ModelBackend for HashingBackend {
    fn backend_name(&self) -> &str {
        "hashing"
    }
}

/// Byte spans of words (alphanumeric runs) and standalone punctuation.
fn word_spans(text: &str) -> Vec<std::ops::Range<usize>> {
    let mut spans = Vec::new();
    let mut word_start: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() {
            word_start.get_or_insert(i);
            continue;
        }
        if let Some(start) = word_start.take() {
            spans.push(start..i);
        }
        if !c.is_whitespace() {
            spans.push(i..i + c.len_utf8());
        }
    }
    if let Some(start) = word_start {
        spans.push(start..text.len());
    }
    spans
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Map the top 24 bits of `x` to [-1, 1).
fn unit_float(x: u64) -> f32 {
    ((x >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
}

fn position_encoding(position: usize, j: usize, dims: usize) -> f32 {
    let exponent = (2 * (j / 2)) as f32 / dims as f32;
    let angle = position as f32 / 10000f32.powf(exponent);
    if j % 2 == 0 { angle.sin() } else { angle.cos() }
}
