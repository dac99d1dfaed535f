use std::path::PathBuf;
use std::str::FromStr;

use super::{Config, JobSourceKind, ProviderKind};

/// Parse `var` if set; invalid values are logged and ignored.
fn parsed<T: FromStr>(var: &str) -> Option<T> {
    let v = std::env::var(var).ok()?;
    if let Ok(parsed) = v.trim().parse() {
        Some(parsed)
    } else {
        tracing::warn!("ignoring invalid {var} value: {v}");
        None
    }
}

fn provider_kind(var: &str) -> Option<ProviderKind> {
    let v = std::env::var(var).ok()?;
    if let Ok(kind) = serde_json::from_value(serde_json::Value::String(v.clone())) {
        Some(kind)
    } else {
        tracing::warn!("ignoring invalid {var} value: {v}");
        None
    }
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_index();
        self.apply_env_overrides_llm();
        self.apply_env_overrides_worker();
    }

    fn apply_env_overrides_index(&mut self) {
        if let Ok(v) = std::env::var("DOCENT_DOCUMENTS_ROOT") {
            self.documents.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DOCENT_DOCUMENTS_EXTENSIONS") {
            self.documents.extensions = v
                .split(',')
                .map(|s| s.trim().trim_start_matches('.').to_owned())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("DOCENT_DOCUMENTS_BASE_URL") {
            self.documents.base_url = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some(n) = parsed("DOCENT_CHUNKER_MAX_CHARS") {
            self.chunker.max_chars = n;
        }
        if let Some(n) = parsed("DOCENT_CHUNKER_MIN_OVERLAP_CHARS") {
            self.chunker.min_overlap_chars = n;
        }
        if let Ok(v) = std::env::var("DOCENT_INDEX_SQLITE_PATH") {
            self.index.sqlite_path = v;
        }
        if let Some(k) = parsed("DOCENT_RETRIEVAL_K") {
            self.retrieval.k = k;
        }
        if let Some(enabled) = parsed("DOCENT_RETRIEVAL_KEYWORD_ENABLED") {
            self.retrieval.keyword_enabled = enabled;
        }
        if let Some(c) = parsed("DOCENT_RETRIEVAL_RANK_CONSTANT") {
            self.retrieval.rank_constant = c;
        }
        if let Some(depth) = parsed("DOCENT_RETRIEVAL_RERANK_DEPTH") {
            self.retrieval.rerank_depth = depth;
        }
    }

    fn apply_env_overrides_llm(&mut self) {
        if let Some(kind) = provider_kind("DOCENT_COMPLETION_PROVIDER") {
            self.llm.completion.provider = kind;
        }
        if let Ok(v) = std::env::var("DOCENT_COMPLETION_BASE_URL") {
            self.llm.completion.base_url = v;
        }
        if let Ok(v) = std::env::var("DOCENT_COMPLETION_MODEL") {
            self.llm.completion.model = v;
        }
        if let Some(kind) = provider_kind("DOCENT_EMBEDDING_PROVIDER") {
            self.llm.embedding.provider = kind;
        }
        if let Ok(v) = std::env::var("DOCENT_EMBEDDING_BASE_URL") {
            self.llm.embedding.base_url = v;
        }
        if let Ok(v) = std::env::var("DOCENT_EMBEDDING_MODEL") {
            self.llm.embedding.model = v;
        }
        if let Some(secs) = parsed("DOCENT_LLM_REQUEST_TIMEOUT") {
            self.llm.request_timeout_secs = secs;
        }
    }

    fn apply_env_overrides_worker(&mut self) {
        if let Ok(v) = std::env::var("DOCENT_WORKER_SOURCE") {
            match v.trim() {
                "sqlite" => self.worker.source = JobSourceKind::Sqlite,
                "http" => self.worker.source = JobSourceKind::Http,
                _ => tracing::warn!("ignoring invalid DOCENT_WORKER_SOURCE value: {v}"),
            }
        }
        if let Ok(v) = std::env::var("DOCENT_WORKER_SQLITE_PATH") {
            self.worker.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("DOCENT_WORKER_HTTP_URL") {
            self.worker.http_url = Some(v);
        }
        if let Some(n) = parsed("DOCENT_WORKER_MAX_ATTEMPTS") {
            self.worker.max_attempts = n;
        }
        if let Some(secs) = parsed("DOCENT_WORKER_COMPLETION_TIMEOUT") {
            self.worker.completion_timeout_secs = secs;
        }
        if let Some(n) = parsed("DOCENT_WORKER_MAX_CONCURRENT_JOBS") {
            self.worker.max_concurrent_jobs = n;
        }
        if let Some(ms) = parsed("DOCENT_WORKER_MIN_POLL_INTERVAL_MS") {
            self.worker.min_poll_interval_ms = ms;
        }
        if let Some(ms) = parsed("DOCENT_WORKER_MAX_POLL_INTERVAL_MS") {
            self.worker.max_poll_interval_ms = ms;
        }
        if let Some(secs) = parsed("DOCENT_WORKER_ABANDON_AFTER") {
            self.worker.abandon_after_secs = secs;
        }
        if let Some(secs) = parsed("DOCENT_WORKER_INDEX_SYNC_SECS") {
            self.worker.index_sync_secs = secs;
        }
        if let Ok(v) = std::env::var("DOCENT_WORKER_HEARTBEAT_PATH") {
            self.worker.heartbeat_path = Some(PathBuf::from(v));
        }
    }
}
