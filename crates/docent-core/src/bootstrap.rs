//! Application bootstrap: config resolution, provider/index/worker construction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use docent_index::store::connect;
use docent_index::{ChunkStore, Chunker, HybridRanker, SourceUrls, Updater};
use docent_llm::LlmProvider;
use docent_llm::any::AnyProvider;
#[cfg(any(test, feature = "mock"))]
use docent_llm::mock::MockProvider;
use docent_llm::ollama::OllamaProvider;
use docent_llm::openai::OpenAiProvider;
use docent_worker::{
    AnswerWorker, AnyJobSource, Heartbeat, HttpJobSource, QuestionAnswerer, SqliteJobSource,
};
use tokio::sync::watch;

use crate::config::{Config, JobSourceKind, ProviderConfig, ProviderKind};
use crate::vault::{EnvVaultProvider, Secret};

pub struct AppBuilder {
    config: Config,
    config_path: PathBuf,
}

impl AppBuilder {
    /// Load and validate the config at `config_path`, then resolve secrets from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be parsed or is invalid.
    pub async fn load(config_path: PathBuf) -> anyhow::Result<Self> {
        let mut config = Config::load(&config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?;
        config.validate()?;
        config.resolve_secrets(&EnvVaultProvider).await?;
        Ok(Self {
            config,
            config_path,
        })
    }

    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            config_path: PathBuf::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.llm.request_timeout_secs)
    }

    /// # Errors
    ///
    /// Returns an error if the configured backend cannot be created.
    pub fn build_completion_provider(&self) -> anyhow::Result<AnyProvider> {
        let llm = &self.config.llm;
        create_provider(
            &llm.completion,
            &llm.completion.model,
            &llm.embedding.model,
            self.config.secrets.completion_api_key.as_ref(),
            self.request_timeout(),
        )
        .context("failed to create completion provider")
    }

    /// # Errors
    ///
    /// Returns an error if the configured backend cannot be created.
    pub fn build_embedding_provider(&self) -> anyhow::Result<AnyProvider> {
        let llm = &self.config.llm;
        create_provider(
            &llm.embedding,
            &llm.completion.model,
            &llm.embedding.model,
            self.config.secrets.embedding_api_key.as_ref(),
            self.request_timeout(),
        )
        .context("failed to create embedding provider")
    }

    /// Open the index database and load it into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub async fn open_store(&self) -> anyhow::Result<Arc<ChunkStore>> {
        let path = &self.config.index.sqlite_path;
        ensure_parent_dir(path).await?;
        let pool = connect(path)
            .await
            .with_context(|| format!("failed to open index database {path}"))?;
        let store = ChunkStore::open(pool)
            .await
            .context("failed to load index")?;
        tracing::info!(path = %path, chunks = store.len(), "index loaded");
        Ok(Arc::new(store))
    }

    /// # Errors
    ///
    /// Returns an error if the chunker settings or base URL are invalid.
    pub fn build_chunker(&self) -> anyhow::Result<Chunker> {
        let urls = SourceUrls::new(self.config.documents.base_url.as_deref())
            .context("invalid documents.base_url")?;
        Chunker::new(self.config.chunker.clone(), urls).context("invalid [chunker] section")
    }

    /// # Errors
    ///
    /// Returns an error if the chunker cannot be built.
    pub fn build_updater(
        &self,
        store: Arc<ChunkStore>,
        embedder: Arc<AnyProvider>,
    ) -> anyhow::Result<Updater<AnyProvider>> {
        Ok(Updater::new(
            store,
            embedder,
            self.build_chunker()?,
            self.config.documents.extensions.clone(),
        ))
    }

    /// Cross-encoder for the rerank stage, `None` unless `[llm.rerank]` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured backend cannot rerank.
    pub fn build_reranker(&self) -> anyhow::Result<Option<AnyProvider>> {
        let Some(cfg) = &self.config.llm.rerank else {
            return Ok(None);
        };
        create_reranker(
            cfg,
            self.config.secrets.rerank_api_key.as_ref(),
            self.request_timeout(),
        )
        .map(Some)
        .context("failed to create rerank provider")
    }

    /// # Errors
    ///
    /// Returns an error if the rerank provider cannot be created.
    pub fn build_ranker(
        &self,
        store: Arc<ChunkStore>,
        embedder: Arc<AnyProvider>,
    ) -> anyhow::Result<HybridRanker<AnyProvider>> {
        let ranker = HybridRanker::new(store, embedder, self.config.retrieval.ranker());
        Ok(match self.build_reranker()? {
            Some(reranker) => {
                tracing::info!(
                    depth = self.config.retrieval.rerank_depth,
                    provider = reranker.name(),
                    "rerank stage enabled"
                );
                ranker.with_reranker(Arc::new(reranker))
            }
            None => ranker,
        })
    }

    /// Index, providers and ranker wired into a question answerer.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider or the index cannot be opened.
    pub async fn build_answerer(&self) -> anyhow::Result<Arc<QuestionAnswerer<AnyProvider>>> {
        let store = self.open_store().await?;
        let embedder = Arc::new(self.build_embedding_provider()?);
        let completer = Arc::new(self.build_completion_provider()?);
        health_check(&embedder).await;
        health_check(&completer).await;
        let ranker = Arc::new(self.build_ranker(store, embedder)?);
        Ok(Arc::new(QuestionAnswerer::new(
            ranker,
            completer,
            self.config.answer(),
        )))
    }

    /// # Errors
    ///
    /// Returns an error if the job database cannot be opened or the HTTP
    /// source is missing its URL.
    pub async fn build_job_source(&self) -> anyhow::Result<AnyJobSource> {
        let worker = &self.config.worker;
        match worker.source {
            JobSourceKind::Sqlite => {
                ensure_parent_dir(&worker.sqlite_path).await?;
                let source = SqliteJobSource::open(&worker.sqlite_path)
                    .await
                    .with_context(|| format!("failed to open job database {}", worker.sqlite_path))?
                    .with_abandon_after(Duration::from_secs(worker.abandon_after_secs));
                Ok(AnyJobSource::Sqlite(source))
            }
            JobSourceKind::Http => {
                let url = worker
                    .http_url
                    .as_deref()
                    .context("worker.http_url is required for the http job source")?;
                let token = self
                    .config
                    .secrets
                    .job_source_token
                    .as_ref()
                    .map(|t| t.expose().to_owned());
                let source = HttpJobSource::new(url, token, self.request_timeout())
                    .context("failed to create HTTP job source")?;
                Ok(AnyJobSource::Http(source))
            }
        }
    }

    #[must_use]
    pub fn build_heartbeat(&self) -> Arc<Heartbeat> {
        Arc::new(Heartbeat::new(self.config.worker.heartbeat_path.clone()))
    }

    #[must_use]
    pub fn build_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    /// # Errors
    ///
    /// Returns an error if any component of the worker cannot be built.
    pub async fn build_worker(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<AnswerWorker<AnyJobSource, AnyProvider>> {
        let answerer = self.build_answerer().await?;
        let source = Arc::new(self.build_job_source().await?);
        Ok(AnswerWorker::new(
            source,
            answerer,
            self.config.worker.poll(),
            self.build_heartbeat(),
            shutdown_rx,
        ))
    }
}

/// `--config` value, then `DOCENT_CONFIG`, then `config/default.toml`.
#[must_use]
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("DOCENT_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("config/default.toml")
}

async fn ensure_parent_dir(db_path: &str) -> anyhow::Result<()> {
    if db_path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = Path::new(db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// # Errors
///
/// Returns an error if the backend cannot be created or is not compiled in.
pub fn create_provider(
    cfg: &ProviderConfig,
    chat_model: &str,
    embedding_model: &str,
    api_key: Option<&Secret>,
    request_timeout: Duration,
) -> anyhow::Result<AnyProvider> {
    match cfg.provider {
        ProviderKind::Ollama => Ok(AnyProvider::Ollama(OllamaProvider::new(
            &cfg.base_url,
            chat_model.to_owned(),
            embedding_model.to_owned(),
        ))),
        ProviderKind::OpenAi => {
            let provider = OpenAiProvider::new(
                api_key.map(|k| k.expose().to_owned()),
                cfg.base_url.clone(),
                chat_model.to_owned(),
                Some(embedding_model.to_owned()),
                request_timeout,
            )?;
            Ok(AnyProvider::OpenAi(provider))
        }
        #[cfg(any(test, feature = "mock"))]
        ProviderKind::Mock => Ok(AnyProvider::Mock(MockProvider::default())),
        #[cfg(not(any(test, feature = "mock")))]
        ProviderKind::Mock => anyhow::bail!("the mock provider requires the `mock` feature"),
    }
}

/// # Errors
///
/// Returns an error if the backend has no rerank endpoint or is not compiled in.
pub fn create_reranker(
    cfg: &ProviderConfig,
    api_key: Option<&Secret>,
    request_timeout: Duration,
) -> anyhow::Result<AnyProvider> {
    match cfg.provider {
        ProviderKind::OpenAi => {
            let provider = OpenAiProvider::new(
                api_key.map(|k| k.expose().to_owned()),
                cfg.base_url.clone(),
                cfg.model.clone(),
                None,
                request_timeout,
            )?
            .with_rerank_model(cfg.model.clone());
            Ok(AnyProvider::OpenAi(provider))
        }
        ProviderKind::Ollama => anyhow::bail!("ollama has no rerank endpoint"),
        #[cfg(any(test, feature = "mock"))]
        ProviderKind::Mock => Ok(AnyProvider::Mock(MockProvider::default())),
        #[cfg(not(any(test, feature = "mock")))]
        ProviderKind::Mock => anyhow::bail!("the mock provider requires the `mock` feature"),
    }
}

pub async fn health_check(provider: &AnyProvider) {
    if let AnyProvider::Ollama(ollama) = provider {
        match ollama.health_check().await {
            Ok(()) => tracing::info!("ollama health check passed"),
            Err(e) => tracing::warn!("ollama health check failed: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use docent_index::RefreshOutcome;
    use docent_worker::{JobSource, JobStatus};

    fn mock_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.documents.root = dir.join("docs");
        config.documents.base_url = Some("https://docs.example.org".into());
        config.index.sqlite_path = dir.join("data/index.db").display().to_string();
        config.worker.sqlite_path = dir.join("data/jobs.db").display().to_string();
        config.worker.heartbeat_path = Some(dir.join("data/worker.heartbeat"));
        config.worker.min_poll_interval_ms = 10;
        config.worker.max_poll_interval_ms = 10;
        config.llm.completion.provider = ProviderKind::Mock;
        config.llm.embedding.provider = ProviderKind::Mock;
        config
    }

    #[test]
    #[serial]
    fn config_path_priority() {
        unsafe { std::env::remove_var("DOCENT_CONFIG") };
        assert_eq!(
            resolve_config_path(None),
            PathBuf::from("config/default.toml")
        );
        unsafe { std::env::set_var("DOCENT_CONFIG", "/etc/docent.toml") };
        assert_eq!(resolve_config_path(None), PathBuf::from("/etc/docent.toml"));
        assert_eq!(
            resolve_config_path(Some(Path::new("cli.toml"))),
            PathBuf::from("cli.toml")
        );
        unsafe { std::env::remove_var("DOCENT_CONFIG") };
    }

    #[test]
    fn providers_follow_configuration() {
        let mut config = Config::default();
        let app = AppBuilder::from_config(Config::default());
        assert!(matches!(
            app.build_completion_provider().unwrap(),
            AnyProvider::Ollama(_)
        ));

        config.llm.embedding.provider = ProviderKind::OpenAi;
        config.llm.embedding.base_url = "https://api.openai.com/v1".into();
        config.llm.embedding.model = "text-embedding-3-small".into();
        let app = AppBuilder::from_config(config);
        assert!(matches!(
            app.build_embedding_provider().unwrap(),
            AnyProvider::OpenAi(_)
        ));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let mut config = Config::default();
        config.documents.base_url = Some("not a url".into());
        assert!(AppBuilder::from_config(config).build_chunker().is_err());
    }

    #[tokio::test]
    async fn index_and_answer_from_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let config = mock_config(dir.path());
        std::fs::create_dir_all(&config.documents.root).unwrap();
        std::fs::write(
            config.documents.root.join("allocations.md"),
            "Allocations: use `sbatch` for batch jobs.",
        )
        .unwrap();
        let app = AppBuilder::from_config(config);

        let store = app.open_store().await.unwrap();
        let embedder = Arc::new(app.build_embedding_provider().unwrap());
        let updater = app.build_updater(Arc::clone(&store), embedder).unwrap();
        let outcome = updater.refresh(&app.config().documents.root).await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Completed(r) if r.documents_updated == 1));
        drop(updater);
        drop(store);

        let answerer = app.build_answerer().await.unwrap();
        let answer = answerer.answer("how do I submit a batch job").await.unwrap();
        assert_eq!(
            answer.references,
            vec!["https://docs.example.org/allocations/".to_owned()]
        );
    }

    #[test]
    fn reranker_follows_configuration() {
        let app = AppBuilder::from_config(Config::default());
        assert!(app.build_reranker().unwrap().is_none());

        let mut config = Config::default();
        config.llm.rerank = Some(ProviderConfig {
            provider: ProviderKind::OpenAi,
            base_url: "http://reranker:8000/v1".into(),
            model: "bge-reranker-v2-m3".into(),
            api_key_env: None,
        });
        let app = AppBuilder::from_config(config);
        let reranker = app.build_reranker().unwrap().unwrap();
        assert!(reranker.supports_rerank());

        let mut config = Config::default();
        config.llm.rerank = Some(ProviderConfig {
            provider: ProviderKind::Ollama,
            base_url: "http://localhost:11434".into(),
            model: "bge-reranker".into(),
            api_key_env: None,
        });
        assert!(AppBuilder::from_config(config).build_reranker().is_err());
    }

    #[tokio::test]
    async fn answerer_with_rerank_stage_answers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = mock_config(dir.path());
        config.llm.rerank = Some(ProviderConfig {
            provider: ProviderKind::Mock,
            base_url: String::new(),
            model: "mock-reranker".into(),
            api_key_env: None,
        });
        std::fs::create_dir_all(&config.documents.root).unwrap();
        std::fs::write(
            config.documents.root.join("allocations.md"),
            "Allocations: use `sbatch` for batch jobs.",
        )
        .unwrap();
        let app = AppBuilder::from_config(config);

        let answerer = app.build_answerer().await.unwrap();
        let store = Arc::clone(answerer.ranker().store());
        let embedder = Arc::new(app.build_embedding_provider().unwrap());
        let updater = app.build_updater(store, embedder).unwrap();
        updater.refresh(&app.config().documents.root).await.unwrap();

        let answer = answerer.answer("how do I submit a batch job").await.unwrap();
        assert_eq!(answer.sources.len(), 1);
    }

    #[tokio::test]
    async fn sqlite_job_source_is_created_with_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppBuilder::from_config(mock_config(dir.path()));
        let AnyJobSource::Sqlite(source) = app.build_job_source().await.unwrap() else {
            panic!("expected the sqlite job source");
        };
        let id = source.enqueue("what is my quota?").await.unwrap();
        assert_eq!(source.list_pending(10).await.unwrap().len(), 1);
        assert_eq!(
            source.get(&id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert!(dir.path().join("data/jobs.db").exists());
    }

    #[tokio::test]
    async fn worker_drains_queue_and_writes_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppBuilder::from_config(mock_config(dir.path()));
        std::fs::create_dir_all(&app.config().documents.root).unwrap();

        let AnyJobSource::Sqlite(jobs) = app.build_job_source().await.unwrap() else {
            panic!("expected the sqlite job source");
        };
        let id = jobs.enqueue("how do I submit a batch job").await.unwrap();

        let (tx, rx) = AppBuilder::build_shutdown();
        let mut worker = app.build_worker(rx).await.unwrap();
        let watcher = async {
            loop {
                if jobs.get(&id).await.unwrap().unwrap().status.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tx.send(true).unwrap();
        };
        tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(worker.run(), watcher);
        })
        .await
        .unwrap();

        assert_eq!(
            jobs.get(&id).await.unwrap().unwrap().status,
            JobStatus::Answered
        );
        let beat = docent_worker::heartbeat::read_heartbeat(
            app.config().worker.heartbeat_path.as_deref().unwrap(),
        )
        .await;
        assert!(beat.is_ok());
    }
}
