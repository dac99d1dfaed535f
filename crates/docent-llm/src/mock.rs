//! Deterministic in-process provider for tests and offline runs.
//!
//! Embeddings are a hashed bag of words: every lowercase alphanumeric token
//! bumps one bucket, then the vector is L2-normalised. Texts that share
//! vocabulary therefore land close to each other in cosine space. Rerank
//! scores are the cosine between the query and document vectors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::LlmError;
use crate::provider::{CompletionOptions, LlmProvider, Message};

pub const DEFAULT_DIMENSION: usize = 64;

#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<String>>>,
    prompts: Arc<Mutex<Vec<Vec<Message>>>>,
    complete_calls: Arc<AtomicUsize>,
    embed_calls: Arc<AtomicUsize>,
    rerank_calls: Arc<AtomicUsize>,
    remaining_failures: Arc<AtomicUsize>,
    pub default_response: String,
    pub dimension: usize,
    pub supports_embeddings: bool,
    pub fail_complete: bool,
    /// Embedding requests whose text contains this marker fail.
    pub fail_embed_marker: Option<String>,
    pub fail_rerank: bool,
    pub delay: Duration,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
            complete_calls: Arc::new(AtomicUsize::new(0)),
            embed_calls: Arc::new(AtomicUsize::new(0)),
            rerank_calls: Arc::new(AtomicUsize::new(0)),
            remaining_failures: Arc::new(AtomicUsize::new(0)),
            default_response: "mock response".into(),
            dimension: DEFAULT_DIMENSION,
            supports_embeddings: true,
            fail_complete: false,
            fail_embed_marker: None,
            fail_rerank: false,
            delay: Duration::ZERO,
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            ..Self::default()
        }
    }

    /// Every completion call fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_complete: true,
            ..Self::default()
        }
    }

    /// The first `n` completion calls fail, later ones succeed.
    #[must_use]
    pub fn failing_first(self, n: usize) -> Self {
        self.remaining_failures.store(n, Ordering::SeqCst);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    #[must_use]
    pub fn with_embed_failure(mut self, marker: impl Into<String>) -> Self {
        self.fail_embed_marker = Some(marker.into());
        self
    }

    #[must_use]
    pub fn with_rerank_failure(mut self) -> Self {
        self.fail_rerank = true;
        self
    }

    #[must_use]
    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn rerank_calls(&self) -> usize {
        self.rerank_calls.load(Ordering::SeqCst)
    }

    /// Message lists received by `complete`, in call order.
    #[must_use]
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_failure(&self) -> bool {
        self.remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Hashed bag-of-words vector, L2-normalised. All-zero for text without tokens.
#[must_use]
pub fn bag_of_words(text: &str, dimension: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dimension.max(1)];
    let len = v.len() as u64;
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let bucket = fnv1a(&token.to_lowercase()) % len;
        #[allow(clippy::cast_possible_truncation)]
        {
            v[bucket as usize] += 1.0;
        }
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

impl LlmProvider for MockProvider {
    async fn complete(
        &self,
        messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_complete || self.take_failure() {
            return Err(LlmError::Other("mock LLM error".into()));
        }
        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Ok(next.unwrap_or_else(|| self.default_response.clone()))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports_embeddings {
            return Err(LlmError::EmbedUnsupported {
                provider: "mock".into(),
            });
        }
        if let Some(marker) = &self.fail_embed_marker
            && text.contains(marker.as_str())
        {
            return Err(LlmError::Other("mock embedding error".into()));
        }
        Ok(bag_of_words(text, self.dimension))
    }

    fn supports_embeddings(&self) -> bool {
        self.supports_embeddings
    }

    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, LlmError> {
        self.rerank_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_rerank {
            return Err(LlmError::Other("mock rerank error".into()));
        }
        let q = bag_of_words(query, self.dimension);
        Ok(documents
            .iter()
            .map(|d| {
                bag_of_words(d, self.dimension)
                    .iter()
                    .zip(&q)
                    .map(|(a, b)| a * b)
                    .sum()
            })
            .collect())
    }

    fn supports_rerank(&self) -> bool {
        true
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }
}
