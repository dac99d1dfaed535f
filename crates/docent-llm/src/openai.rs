use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::provider::{CompletionOptions, LlmProvider, Message};
use crate::retry::{check_status, send_with_retry};

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Provider for any server speaking the OpenAI `/chat/completions` and
/// `/embeddings` wire format (OpenAI, vLLM, llama.cpp server, LM Studio).
/// Servers that also expose `/rerank` (vLLM, llama.cpp, Jina, Cohere
/// compatible) can score passages once a rerank model is set.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    embedding_model: Option<String>,
    rerank_model: Option<String>,
}

impl fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .field("rerank_model", &self.rerank_model)
            .finish_non_exhaustive()
    }
}

impl OpenAiProvider {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        api_key: Option<String>,
        mut base_url: String,
        model: String,
        embedding_model: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            client: crate::http::build_client(request_timeout)?,
            api_key,
            base_url,
            model,
            embedding_model,
            rerank_model: None,
        })
    }

    /// Enable [`LlmProvider::rerank`] against `{base_url}/rerank`.
    #[must_use]
    pub fn with_rerank_model(mut self, model: impl Into<String>) -> Self {
        self.rerank_model = Some(model.into());
        self
    }

    async fn post_json<B: Serialize + Sync>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let response = send_with_retry("openai", MAX_RATE_LIMIT_RETRIES, || {
            let mut req = self.client.post(&url).json(body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            req.send()
        })
        .await?;
        check_status("openai", response).await
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

impl LlmProvider for OpenAiProvider {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stop: &options.stop,
        };
        let resp: ChatResponse = self.post_json("chat/completions", &body).await?.json().await?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::EmptyResponse {
                provider: "openai".into(),
            })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let model = self
            .embedding_model
            .as_deref()
            .ok_or(LlmError::EmbedUnsupported {
                provider: "openai".into(),
            })?;

        let body = EmbeddingRequest { input: text, model };
        let resp: EmbeddingResponse = self.post_json("embeddings", &body).await?.json().await?;

        resp.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(LlmError::EmptyResponse {
                provider: "openai".into(),
            })
    }

    fn supports_embeddings(&self) -> bool {
        self.embedding_model.is_some()
    }

    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, LlmError> {
        let model = self
            .rerank_model
            .as_deref()
            .ok_or(LlmError::RerankUnsupported {
                provider: "openai".into(),
            })?;
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let body = RerankRequest {
            model,
            query,
            documents,
        };
        let resp: RerankResponse = self.post_json("rerank", &body).await?.json().await?;

        // results may be sorted by score and omit documents
        let mut scores = vec![f32::NEG_INFINITY; documents.len()];
        for result in resp.results {
            let slot = scores.get_mut(result.index).ok_or_else(|| {
                LlmError::Other(format!("rerank result index {} out of range", result.index))
            })?;
            *slot = result.relevance_score;
        }
        Ok(scores)
    }

    fn supports_rerank(&self) -> bool {
        self.rerank_model.is_some()
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: &str, embedding_model: Option<&str>) -> OpenAiProvider {
        OpenAiProvider::new(
            Some("sk-test".into()),
            format!("{base_url}/v1/"),
            "gpt-test".into(),
            embedding_model.map(str::to_owned),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn complete_sends_model_options_and_parses_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-test",
                "max_tokens": 128,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "hello"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let p = provider(&server.uri(), None);
        let opts = CompletionOptions {
            max_tokens: 128,
            ..CompletionOptions::default()
        };
        let reply = p.complete(&[Message::user("hi")], &opts).await.unwrap();
        assert_eq!(reply, "hello");
    }

    #[tokio::test]
    async fn complete_without_choices_is_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let p = provider(&server.uri(), None);
        let err = p
            .complete(&[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse { .. }));
    }

    #[tokio::test]
    async fn complete_surfaces_server_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let p = provider(&server.uri(), None);
        let err = p
            .complete(&[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 500, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn embed_returns_first_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(body_partial_json(serde_json::json!({"model": "embed-small"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.5, -0.25, 1.0]}]
            })))
            .mount(&server)
            .await;

        let p = provider(&server.uri(), Some("embed-small"));
        assert!(p.supports_embeddings());
        assert_eq!(p.embed("text").await.unwrap(), vec![0.5, -0.25, 1.0]);
    }

    #[tokio::test]
    async fn embed_without_model_returns_unsupported() {
        let p = provider("http://127.0.0.1:1", None);
        assert!(!p.supports_embeddings());
        assert!(matches!(
            p.embed("test").await,
            Err(LlmError::EmbedUnsupported { .. })
        ));
    }

    #[tokio::test]
    async fn truncated_completion_body_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_string(r#"{"choices": [{"message": {"content": "Use sb"#),
            )
            .mount(&server)
            .await;

        let p = provider(&server.uri(), None);
        let err = p
            .complete(&[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn rerank_maps_scores_back_to_input_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/rerank"))
            .and(body_partial_json(serde_json::json!({
                "model": "rerank-small",
                "query": "gpu",
                "documents": ["cpu nodes", "gpu nodes", "login"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"index": 1, "relevance_score": 0.9},
                    {"index": 0, "relevance_score": 0.2}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let p = provider(&server.uri(), None).with_rerank_model("rerank-small");
        assert!(p.supports_rerank());
        let docs = vec!["cpu nodes".to_owned(), "gpu nodes".into(), "login".into()];
        let scores = p.rerank("gpu", &docs).await.unwrap();
        assert_eq!(scores[0], 0.2);
        assert_eq!(scores[1], 0.9);
        assert_eq!(scores[2], f32::NEG_INFINITY);
    }

    #[tokio::test]
    async fn rerank_rejects_out_of_range_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/rerank"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{"index": 5, "relevance_score": 0.9}]
            })))
            .mount(&server)
            .await;

        let p = provider(&server.uri(), None).with_rerank_model("rerank-small");
        let err = p.rerank("q", &["only".to_owned()]).await.unwrap_err();
        assert!(matches!(err, LlmError::Other(_)));
    }

    #[tokio::test]
    async fn rerank_without_model_returns_unsupported() {
        let p = provider("http://127.0.0.1:1", None);
        assert!(!p.supports_rerank());
        assert!(matches!(
            p.rerank("q", &["d".to_owned()]).await,
            Err(LlmError::RerankUnsupported { .. })
        ));
    }

    #[test]
    fn debug_redacts_api_key() {
        let p = provider("http://localhost", None);
        let debug = format!("{p:?}");
        assert!(!debug.contains("sk-test"));
        assert!(debug.contains("<redacted>"));
    }
}
