#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("{provider} returned status {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("embedding not supported by {provider}")]
    EmbedUnsupported { provider: String },

    #[error("reranking not supported by {provider}")]
    RerankUnsupported { provider: String },

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Whether retrying the same request may succeed. A truncated or
    /// malformed response body counts as transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode()
            }
            Self::Json(_) | Self::RateLimited | Self::EmptyResponse { .. } | Self::Other(_) => {
                true
            }
            Self::Status { status, .. } => *status >= 500,
            Self::EmbedUnsupported { .. } | Self::RerankUnsupported { .. } => false,
        }
    }

    /// Whether the request can never succeed without a configuration
    /// change: rejected credentials, an unknown endpoint or model, or a
    /// capability the backend lacks.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Status { status, .. } => matches!(status, 400 | 401 | 403 | 404),
            Self::EmbedUnsupported { .. } | Self::RerankUnsupported { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
