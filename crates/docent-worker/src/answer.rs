use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use docent_index::{HybridRanker, ScoredChunk};
use docent_llm::retry::exponential_backoff;
use docent_llm::{CompletionOptions, LlmProvider};

use crate::error::{Result, WorkerError};
use crate::job::Answer;
use crate::prompt;

#[derive(Debug, Clone)]
pub struct AnswerConfig {
    /// Chunks retrieved per question.
    pub top_k: usize,
    /// Attempts per job, the first included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub completion_timeout: Duration,
    pub max_context_chars: usize,
    /// Ignore `#fragment` when checking cited URLs.
    pub stem_references: bool,
    /// Listed when the model cites nothing usable.
    pub default_references: Vec<String>,
    pub completion: CompletionOptions,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            completion_timeout: Duration::from_secs(60),
            max_context_chars: 12_000,
            stem_references: true,
            default_references: Vec::new(),
            completion: CompletionOptions::default(),
        }
    }
}

/// Retrieval plus completion for a single question, with timeout and retries.
pub struct QuestionAnswerer<P> {
    ranker: Arc<HybridRanker<P>>,
    provider: Arc<P>,
    config: AnswerConfig,
}

impl<P: LlmProvider> QuestionAnswerer<P> {
    #[must_use]
    pub fn new(ranker: Arc<HybridRanker<P>>, provider: Arc<P>, config: AnswerConfig) -> Self {
        Self {
            ranker,
            provider,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AnswerConfig {
        &self.config
    }

    #[must_use]
    pub fn ranker(&self) -> &Arc<HybridRanker<P>> {
        &self.ranker
    }

    /// Answer `question`, retrying failed attempts with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error once `max_attempts` is exhausted, or
    /// immediately for errors that cannot succeed on retry.
    pub async fn answer(&self, question: &str) -> Result<Answer> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match self.attempt(question).await {
                Ok(answer) => return Ok(answer),
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts || !e.is_retryable() {
                        return Err(e);
                    }
                    let delay = exponential_backoff(
                        self.config.backoff_base,
                        attempt - 1,
                        self.config.backoff_max,
                    );
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "answer attempt failed: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(&self, question: &str) -> Result<Answer> {
        let chunks = self.ranker.retrieve(question, self.config.top_k).await?;
        let messages = prompt::build_messages(question, &chunks, self.config.max_context_chars);

        let raw = tokio::time::timeout(
            self.config.completion_timeout,
            self.provider.complete(&messages, &self.config.completion),
        )
        .await
        .map_err(|_| WorkerError::Timeout(self.config.completion_timeout))??;

        let (body, cited) = prompt::split_references(&raw);
        if body.trim().is_empty() {
            return Err(WorkerError::MalformedOutput(
                "completion has no answer body".into(),
            ));
        }

        let mut references =
            prompt::validate_references(&cited, &chunks, self.config.stem_references);
        if references.is_empty() {
            references = self.fallback_references(&chunks);
        }
        tracing::debug!(
            cited = cited.len(),
            kept = references.len(),
            chunks = chunks.len(),
            "answer assembled"
        );

        Ok(Answer {
            text: prompt::format_answer(body, &references),
            sources: chunks
                .iter()
                .map(|c| c.chunk.id.as_str().to_owned())
                .collect(),
            references,
        })
    }

    /// Configured defaults, or the best distinct retrieved URLs when none are configured.
    fn fallback_references(&self, chunks: &[ScoredChunk]) -> Vec<String> {
        if !self.config.default_references.is_empty() {
            return self.config.default_references.clone();
        }
        let mut seen = HashSet::new();
        chunks
            .iter()
            .map(|c| prompt::stem_url(&c.chunk.url).to_owned())
            .filter(|url| seen.insert(url.clone()))
            .take(3)
            .collect()
    }

    /// Text published for a job whose attempts all failed.
    #[must_use]
    pub fn failure_message(&self, error: &WorkerError) -> String {
        let message = format!(
            "ERROR: unable to answer this question because {}. Please try again later.",
            error.user_reason()
        );
        prompt::format_answer(&message, &self.config.default_references)
    }
}
