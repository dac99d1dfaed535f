use std::path::PathBuf;
use std::time::Duration;

use docent_index::{ChunkerConfig, RankerConfig};
use docent_llm::CompletionOptions;
use docent_worker::{AnswerConfig, PollConfig};
use serde::{Deserialize, Serialize};

use crate::vault::Secret;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(skip)]
    pub secrets: ResolvedSecrets,
}

/// API keys and tokens looked up through the vault, never serialized.
#[derive(Debug, Default)]
pub struct ResolvedSecrets {
    pub completion_api_key: Option<Secret>,
    pub embedding_api_key: Option<Secret>,
    pub rerank_api_key: Option<Secret>,
    pub job_source_token: Option<Secret>,
}

fn default_documents_root() -> PathBuf {
    PathBuf::from("./docs")
}

fn default_extensions() -> Vec<String> {
    vec!["md".into()]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DocumentsConfig {
    #[serde(default = "default_documents_root")]
    pub root: PathBuf,
    /// File suffixes, without the dot, that are indexed.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Published site the documents are rendered to; chunk URLs are relative paths when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            root: default_documents_root(),
            extensions: default_extensions(),
            base_url: None,
        }
    }
}

fn default_index_path() -> String {
    "./data/docent-index.db".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub sqlite_path: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_index_path(),
        }
    }
}

fn default_k() -> usize {
    8
}

fn default_candidate_multiplier() -> usize {
    4
}

fn default_rank_constant() -> f64 {
    60.0
}

fn default_true() -> bool {
    true
}

fn default_max_context_chars() -> usize {
    12_000
}

fn default_rerank_depth() -> usize {
    20
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_rank_constant")]
    pub rank_constant: f64,
    #[serde(default = "default_true")]
    pub keyword_enabled: bool,
    /// Upper bound on rendered extracts per prompt.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Fused candidates rescored when `[llm.rerank]` is set.
    #[serde(default = "default_rerank_depth")]
    pub rerank_depth: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            candidate_multiplier: default_candidate_multiplier(),
            rank_constant: default_rank_constant(),
            keyword_enabled: true,
            max_context_chars: default_max_context_chars(),
            rerank_depth: default_rerank_depth(),
        }
    }
}

impl RetrievalConfig {
    #[must_use]
    pub fn ranker(&self) -> RankerConfig {
        RankerConfig {
            candidate_multiplier: self.candidate_multiplier,
            rank_constant: self.rank_constant,
            keyword_enabled: self.keyword_enabled,
            rerank_depth: self.rerank_depth,
        }
    }
}

/// Backend selector for completion and embedding providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    OpenAi,
    /// Deterministic offline provider, only available with the `mock` feature.
    Mock,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::Mock => "mock",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_base_url() -> String {
    "http://localhost:11434".into()
}

fn default_completion_model() -> String {
    "mistral:7b".into()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".into()
}

fn default_ollama() -> ProviderKind {
    ProviderKind::Ollama
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_ollama")]
    pub provider: ProviderKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key for hosted backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

fn default_completion_provider() -> ProviderConfig {
    ProviderConfig {
        provider: ProviderKind::Ollama,
        base_url: default_base_url(),
        model: default_completion_model(),
        api_key_env: None,
    }
}

fn default_embedding_provider() -> ProviderConfig {
    ProviderConfig {
        provider: ProviderKind::Ollama,
        base_url: default_base_url(),
        model: default_embedding_model(),
        api_key_env: None,
    }
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_completion_provider")]
    pub completion: ProviderConfig,
    #[serde(default = "default_embedding_provider")]
    pub embedding: ProviderConfig,
    /// HTTP timeout for hosted backends.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Cross-encoder that rescores fused candidates; retrieval skips the
    /// rerank stage when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank: Option<ProviderConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            completion: default_completion_provider(),
            embedding: default_embedding_provider(),
            request_timeout_secs: default_request_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            rerank: None,
        }
    }
}

impl LlmConfig {
    #[must_use]
    pub fn completion_options(&self) -> CompletionOptions {
        CompletionOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            ..CompletionOptions::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSourceKind {
    Sqlite,
    Http,
}

fn default_job_source() -> JobSourceKind {
    JobSourceKind::Sqlite
}

fn default_jobs_path() -> String {
    "./data/docent-jobs.db".into()
}

fn default_min_poll_ms() -> u64 {
    1000
}

fn default_max_poll_ms() -> u64 {
    5000
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_completion_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_jobs() -> usize {
    100
}

fn default_batch_size() -> usize {
    100
}

fn default_abandon_after_secs() -> u64 {
    900
}

fn default_index_sync_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_job_source")]
    pub source: JobSourceKind,
    #[serde(default = "default_jobs_path")]
    pub sqlite_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_url: Option<String>,
    /// Environment variable holding the bearer token for the HTTP job source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_token_env: Option<String>,
    #[serde(default = "default_min_poll_ms")]
    pub min_poll_interval_ms: u64,
    #[serde(default = "default_max_poll_ms")]
    pub max_poll_interval_ms: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// In-progress SQLite jobs older than this return to pending.
    #[serde(default = "default_abandon_after_secs")]
    pub abandon_after_secs: u64,
    /// How often the worker picks up index changes made by `docent update`.
    #[serde(default = "default_index_sync_secs")]
    pub index_sync_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub stem_references: bool,
    #[serde(default)]
    pub default_references: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            source: default_job_source(),
            sqlite_path: default_jobs_path(),
            http_url: None,
            http_token_env: None,
            min_poll_interval_ms: default_min_poll_ms(),
            max_poll_interval_ms: default_max_poll_ms(),
            cooldown_secs: default_cooldown_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            completion_timeout_secs: default_completion_timeout_secs(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            batch_size: default_batch_size(),
            abandon_after_secs: default_abandon_after_secs(),
            index_sync_secs: default_index_sync_secs(),
            heartbeat_path: None,
            stem_references: true,
            default_references: Vec::new(),
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn poll(&self) -> PollConfig {
        PollConfig {
            min_poll_interval: Duration::from_millis(self.min_poll_interval_ms),
            max_poll_interval: Duration::from_millis(self.max_poll_interval_ms),
            cooldown: Duration::from_secs(self.cooldown_secs),
            max_concurrent_jobs: self.max_concurrent_jobs,
            batch_size: self.batch_size,
            index_sync_interval: Duration::from_secs(self.index_sync_secs),
        }
    }
}

impl Config {
    /// Settings for answering a single question.
    #[must_use]
    pub fn answer(&self) -> AnswerConfig {
        AnswerConfig {
            top_k: self.retrieval.k,
            max_attempts: self.worker.max_attempts,
            backoff_base: Duration::from_millis(self.worker.backoff_base_ms),
            backoff_max: Duration::from_millis(self.worker.backoff_max_ms),
            completion_timeout: Duration::from_secs(self.worker.completion_timeout_secs),
            max_context_chars: self.retrieval.max_context_chars,
            stem_references: self.worker.stem_references,
            default_references: self.worker.default_references.clone(),
            completion: self.llm.completion_options(),
        }
    }
}
