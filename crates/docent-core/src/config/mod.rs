mod env;
mod types;


pub use types::*;

use std::path::Path;

use anyhow::{Context, bail};

use crate::vault::{Secret, VaultProvider};

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject settings the index and worker cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first inconsistent setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.chunker
            .validate()
            .context("invalid [chunker] section")?;
        if self.documents.extensions.is_empty() {
            bail!("documents.extensions must not be empty");
        }
        if self.retrieval.k == 0 {
            bail!("retrieval.k must be at least 1");
        }
        if self.retrieval.candidate_multiplier == 0 {
            bail!("retrieval.candidate_multiplier must be at least 1");
        }
        if !(self.retrieval.rank_constant.is_finite() && self.retrieval.rank_constant >= 0.0) {
            bail!("retrieval.rank_constant must be a non-negative number");
        }
        if self.retrieval.rerank_depth == 0 {
            bail!("retrieval.rerank_depth must be at least 1");
        }
        if let Some(rerank) = &self.llm.rerank
            && rerank.provider == ProviderKind::Ollama
        {
            bail!("llm.rerank: ollama has no rerank endpoint");
        }
        if self.worker.max_attempts == 0 {
            bail!("worker.max_attempts must be at least 1");
        }
        if self.worker.max_concurrent_jobs == 0 || self.worker.batch_size == 0 {
            bail!("worker.max_concurrent_jobs and worker.batch_size must be at least 1");
        }
        if self.worker.completion_timeout_secs == 0 {
            bail!("worker.completion_timeout_secs must be at least 1");
        }
        if self.worker.min_poll_interval_ms > self.worker.max_poll_interval_ms {
            bail!("worker.min_poll_interval_ms must not exceed worker.max_poll_interval_ms");
        }
        if self.worker.source == JobSourceKind::Http && self.worker.http_url.is_none() {
            bail!("worker.http_url is required for the http job source");
        }
        Ok(())
    }

    /// Resolve API keys and tokens named by `*_env` settings through the vault.
    ///
    /// # Errors
    ///
    /// Returns an error if the vault backend fails.
    pub async fn resolve_secrets(&mut self, vault: &dyn VaultProvider) -> anyhow::Result<()> {
        if let Some(key) = &self.llm.completion.api_key_env
            && let Some(val) = vault.get_secret(key).await?
        {
            self.secrets.completion_api_key = Some(Secret::new(val));
        }
        if let Some(key) = &self.llm.embedding.api_key_env
            && let Some(val) = vault.get_secret(key).await?
        {
            self.secrets.embedding_api_key = Some(Secret::new(val));
        }
        if let Some(key) = self.llm.rerank.as_ref().and_then(|r| r.api_key_env.as_ref())
            && let Some(val) = vault.get_secret(key).await?
        {
            self.secrets.rerank_api_key = Some(Secret::new(val));
        }
        if let Some(key) = &self.worker.http_token_env
            && let Some(val) = vault.get_secret(key).await?
        {
            self.secrets.job_source_token = Some(Secret::new(val));
        }
        Ok(())
    }
}
