//! Text to vector pipeline.
//!
//! `embed` tokenizes, checks the context window before any inference work,
//! runs the backend once over the whole token sequence and pools the result
//! down to exactly `dimensions` floats.

use crate::model::{Model, ModelMetadata};
use crate::options::PoolingType;

use super::{EmbedError, Embedding, HiddenStates, ModelBackend, Token, TokenBatch};

/// Compute the embedding of `text` with `model`.
pub fn embed(model: &Model, text: &str) -> Result<Embedding, EmbedError> {
    let normalize = model.options().normalize();
    model.with_backend(|backend| embed_with(backend, model.metadata(), normalize, text))?
}

fn embed_with(
    backend: &mut dyn ModelBackend,
    metadata: &ModelMetadata,
    normalize: bool,
    text: &str,
) -> Result<Embedding, EmbedError> {
    let tokens = backend
        .tokenize(text)
        .map_err(|e| EmbedError::Inference(format!("tokenization failed: {e}")))?;
    check_context_window(tokens.len(), metadata.context_window)?;
    if tokens.is_empty() {
        return Err(EmbedError::Inference("input produced no tokens".into()));
    }

    let states = backend
        .infer(TokenBatch {
            text,
            tokens: &tokens,
        })
        .map_err(EmbedError::Inference)?;

    let mut pooled = pool(states, metadata.pooling_type, &tokens, metadata.dimensions)?;
    if normalize {
        l2_normalize(&mut pooled);
    }
    Ok(Embedding::new(pooled))
}

/// Fail with `InputTooLong` when `tokens` exceeds `context_window`.
pub fn check_context_window(tokens: usize, context_window: usize) -> Result<(), EmbedError> {
    if tokens > context_window {
        return Err(EmbedError::InputTooLong {
            tokens,
            context_window,
        });
    }
    Ok(())
}

/// Reduce backend output to one vector of length `dimensions`.
pub fn pool(
    states: HiddenStates,
    pooling: PoolingType,
    tokens: &[Token],
    dimensions: usize,
) -> Result<Vec<f32>, EmbedError> {
    let per_token = match states {
        HiddenStates::Pooled(vector) => {
            check_width(vector.len(), dimensions)?;
            return Ok(vector);
        }
        HiddenStates::PerToken(rows) => rows,
    };

    if per_token.is_empty() {
        return Err(EmbedError::Inference("backend returned no hidden states".into()));
    }

    if per_token.len() != tokens.len() {
        return Err(EmbedError::Inference(format!(
            "backend returned {} hidden states for {} tokens",
            per_token.len(),
            tokens.len()
        )));
    }
    for row in &per_token {
        check_width(row.len(), dimensions)?;
    }

    match pooling {
        PoolingType::None => Ok(take_row(per_token, 0)),
        PoolingType::Cls => {
            let position = tokens.iter().position(|t| t.special).unwrap_or(0);
            Ok(take_row(per_token, position))
        }
        PoolingType::Mean => {
            let n = per_token.len() as f32;
            let mut sum = vec![0.0f32; dimensions];
            for row in &per_token {
                for (acc, v) in sum.iter_mut().zip(row) {
                    *acc += v;
                }
            }
            for v in &mut sum {
                *v /= n;
            }
            Ok(sum)
        }
    }
}

fn take_row(mut rows: Vec<Vec<f32>>, index: usize) -> Vec<f32> {
    rows.swap_remove(index)
}

fn check_width(width: usize, dimensions: usize) -> Result<(), EmbedError> {
    if width != dimensions {
        return Err(EmbedError::Inference(format!(
            "backend returned a {width}-wide vector, expected {dimensions}"
        )));
    }
    Ok(())
}

/// Scale `vector` to unit length. A zero vector is left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::embedding::{InferenceAdapter, TokenId, TokenizerAdapter};
    use crate::model::{LoadedModel, ModelLoader, ModelSource};
    use crate::options::{ModelOptions, OptionKey};

    /// One token per whitespace-separated word, no implicit tokens. Counts
    /// inference calls and optionally fails them.
    struct CountingBackend {
        infers: Arc<AtomicUsize>,
        failure: Option<&'static str>,
    }

    impl TokenizerAdapter for CountingBackend {
        fn tokenize(&self, text: &str) -> Result<Vec<Token>, String> {
            Ok(text
                .split_whitespace()
                .enumerate()
                .map(|(i, _)| Token {
                    id: i as TokenId,
                    special: false,
                    span: 0..0,
                })
                .collect())
        }

        fn token_to_piece(&self, _id: TokenId) -> Option<String> {
            None
        }

        fn token_score(&self, _id: TokenId) -> Option<f32> {
            None
        }
    }

    impl InferenceAdapter for CountingBackend {
        fn infer(&mut self, batch: TokenBatch<'_>) -> Result<HiddenStates, String> {
            self.infers.fetch_add(1, Ordering::SeqCst);
            match self.failure {
                Some(msg) => Err(msg.to_string()),
                None => Ok(HiddenStates::PerToken(vec![vec![3.0, 4.0]; batch.tokens.len()])),
            }
        }
    }

    impl ModelBackend for CountingBackend {
        fn backend_name(&self) -> &str {
            "counting"
        }
    }

    struct CountingLoader {
        infers: Arc<AtomicUsize>,
        failure: Option<&'static str>,
    }

    impl ModelLoader for CountingLoader {
        fn name(&self) -> &str {
            "counting"
        }

        fn accepts(&self, _source: &ModelSource) -> bool {
            true
        }

        fn supported_options(&self) -> &[OptionKey] {
            &[]
        }

        fn load(&self, _source: &ModelSource, _options: &ModelOptions) -> Result<LoadedModel, String> {
            Ok(LoadedModel {
                backend: Box::new(CountingBackend {
                    infers: Arc::clone(&self.infers),
                    failure: self.failure,
                }),
                metadata: ModelMetadata {
                    dimensions: 2,
                    context_window: 3,
                    pooling_type: PoolingType::Mean,
                    size_bytes: None,
                },
            })
        }
    }

    fn counting_model(failure: Option<&'static str>) -> (Model, Arc<AtomicUsize>) {
        let infers = Arc::new(AtomicUsize::new(0));
        let loader = CountingLoader {
            infers: Arc::clone(&infers),
            failure,
        };
        let model = Model::load(&loader, &ModelSource::path("counting"), &ModelOptions::default())
            .unwrap();
        (model, infers)
    }

    fn tokens(n: usize) -> Vec<Token> {
        (0..n)
            .map(|i| Token {
                id: i as u32,
                special: i == 0 || i + 1 == n,
                span: 0..0,
            })
            .collect()
    }

    fn states() -> HiddenStates {
        HiddenStates::PerToken(vec![
            vec![1.0, 0.0],
            vec![3.0, 4.0],
            vec![2.0, 2.0],
        ])
    }

    #[test]
    fn context_window_boundary_is_inclusive() {
        assert!(check_context_window(512, 512).is_ok());
        let err = check_context_window(513, 512).unwrap_err();
        assert_eq!(
            err,
            EmbedError::InputTooLong {
                tokens: 513,
                context_window: 512
            }
        );
        assert!(err
            .to_string()
            .contains("provided 513 tokens, but model has context size of 512"));
    }

    #[test]
    fn oversized_input_never_reaches_the_backend() {
        let (model, infers) = counting_model(None);
        let err = embed(&model, "a b c d").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Input too long, provided 4 tokens, but model has context size of 3"
        );
        assert_eq!(infers.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn input_filling_the_window_is_embedded_once() {
        let (model, infers) = counting_model(None);
        let embedding = embed(&model, "a b c").unwrap();
        assert_eq!(embedding.into_vec(), vec![0.6f32, 0.8]);
        assert_eq!(infers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backend_failure_is_wrapped_verbatim() {
        let (model, infers) = counting_model(Some("kernel exploded"));
        let err = embed(&model, "a b").unwrap_err();
        assert_eq!(err, EmbedError::Inference("kernel exploded".into()));
        assert_eq!(err.to_string(), "Error generating embedding: kernel exploded");
        assert_eq!(infers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pooling_empty_hidden_states_is_an_error() {
        for pooling in [PoolingType::None, PoolingType::Mean, PoolingType::Cls] {
            let err = pool(HiddenStates::PerToken(vec![]), pooling, &[], 2).unwrap_err();
            assert_eq!(
                err.to_string(),
                "Error generating embedding: backend returned no hidden states"
            );
        }
    }

    #[test]
    fn mean_pooling_averages_every_token() {
        let pooled = pool(states(), PoolingType::Mean, &tokens(3), 2).unwrap();
        assert_eq!(pooled, vec![2.0, 2.0]);
    }

    #[test]
    fn none_pooling_takes_first_token() {
        let pooled = pool(states(), PoolingType::None, &tokens(3), 2).unwrap();
        assert_eq!(pooled, vec![1.0, 0.0]);
    }

    #[test]
    fn cls_pooling_uses_first_special_token() {
        let mut toks = tokens(3);
        toks[0].special = false;
        let pooled = pool(states(), PoolingType::Cls, &toks, 2).unwrap();
        assert_eq!(pooled, vec![2.0, 2.0]);
    }

    #[test]
    fn pooled_output_must_match_dimensions() {
        let err = pool(HiddenStates::Pooled(vec![1.0; 3]), PoolingType::Mean, &tokens(2), 4)
            .unwrap_err();
        assert!(matches!(err, EmbedError::Inference(_)));
    }

    #[test]
    fn hidden_state_count_must_match_tokens() {
        let err = pool(states(), PoolingType::Mean, &tokens(4), 2).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error generating embedding: backend returned 3 hidden states for 4 tokens"
        );
    }

    #[test]
    fn normalize_produces_unit_vector_and_keeps_zero() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.6, 0.8]);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
