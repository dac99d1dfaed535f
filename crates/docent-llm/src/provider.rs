use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters forwarded to the completion backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.2,
            stop: Vec::new(),
        }
    }
}

pub trait LlmProvider: Send + Sync {
    /// Run a chat completion and return the assistant text.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or the response is malformed.
    fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> impl Future<Output = Result<String, LlmError>> + Send;

    /// Map text to a dense vector.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or does not support embeddings.
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, LlmError>> + Send;

    fn supports_embeddings(&self) -> bool;

    /// Relevance of each of `documents` to `query`, one score per document
    /// in input order. Higher is more relevant.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or has no rerank endpoint.
    fn rerank(
        &self,
        query: &str,
        documents: &[String],
    ) -> impl Future<Output = Result<Vec<f32>, LlmError>> + Send;

    fn supports_rerank(&self) -> bool;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::system("be brief")).unwrap();
        assert_eq!(json, r#"{"role":"system","content":"be brief"}"#);
    }

    #[test]
    fn completion_options_stop_defaults_to_empty() {
        let opts: CompletionOptions =
            serde_json::from_str(r#"{"max_tokens":64,"temperature":0.0}"#).unwrap();
        assert!(opts.stop.is_empty());
        assert_eq!(opts.max_tokens, 64);
    }
}
