use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobSourceError {
    /// Another worker claimed the job first.
    #[error("job {0} already claimed")]
    Conflict(String),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("job source returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("corrupt job record: {0}")]
    Corrupt(String),
    #[error("invalid job payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid job source URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("completion timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),
    #[error("completion failed: {0}")]
    Completion(#[from] docent_llm::LlmError),
    #[error("malformed completion output: {0}")]
    MalformedOutput(String),
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] docent_index::IndexError),
    #[error(transparent)]
    Source(#[from] JobSourceError),
}

impl WorkerError {
    /// Whether another attempt at the same job may succeed. Completion
    /// errors are retried unless they need a configuration change.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::MalformedOutput(_) | Self::Retrieval(_) => true,
            Self::Completion(e) => !e.is_permanent(),
            Self::Source(_) => false,
        }
    }

    /// Short description suitable for end users.
    #[must_use]
    pub fn user_reason(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "the language model did not respond in time",
            Self::Completion(_) => "the language model returned an error",
            Self::MalformedOutput(_) => "the language model produced an unusable answer",
            Self::Retrieval(_) => "the documentation search failed",
            Self::Source(_) => "the job queue could not be reached",
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use docent_llm::LlmError;

    #[test]
    fn retry_policy() {
        assert!(WorkerError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(WorkerError::MalformedOutput("empty".into()).is_retryable());
        assert!(WorkerError::Completion(LlmError::RateLimited).is_retryable());
        assert!(
            !WorkerError::Completion(LlmError::Status {
                provider: "openai".into(),
                status: 401,
                body: String::new(),
            })
            .is_retryable()
        );
        assert!(!WorkerError::Source(JobSourceError::NotFound("1".into())).is_retryable());
    }

    #[test]
    fn garbled_completion_is_retryable() {
        let json = serde_json::from_str::<serde_json::Value>(r#"{"choices": [{"message""#)
            .unwrap_err();
        assert!(WorkerError::Completion(LlmError::Json(json)).is_retryable());
        assert!(WorkerError::Completion(LlmError::Other("reset".into())).is_retryable());
        assert!(
            !WorkerError::Completion(LlmError::EmbedUnsupported {
                provider: "openai".into()
            })
            .is_retryable()
        );
    }

    #[test]
    fn timeout_display() {
        assert_eq!(
            WorkerError::Timeout(Duration::from_millis(1500)).to_string(),
            "completion timed out after 1.5s"
        );
    }
}
