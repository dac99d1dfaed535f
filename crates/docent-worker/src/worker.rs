use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use docent_llm::LlmProvider;
use docent_llm::retry::exponential_backoff;
use futures::StreamExt;
use tokio::sync::watch;

use crate::answer::QuestionAnswerer;
use crate::error::JobSourceError;
use crate::heartbeat::Heartbeat;
use crate::job::{Job, JobId, JobOutcome};
use crate::source::JobSource;

const PUBLISH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Poll period while jobs were seen within `cooldown`.
    pub min_poll_interval: Duration,
    /// Poll period once the queue has been idle for `cooldown`.
    pub max_poll_interval: Duration,
    pub cooldown: Duration,
    pub max_concurrent_jobs: usize,
    /// Pending jobs fetched per poll.
    pub batch_size: usize,
    /// How often the in-memory index is reconciled with the database, so
    /// refreshes run by `docent update` reach a long-lived worker.
    pub index_sync_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_poll_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(5),
            cooldown: Duration::from_secs(300),
            max_concurrent_jobs: 100,
            batch_size: 100,
            index_sync_interval: Duration::from_secs(30),
        }
    }
}

/// Delay before the next poll given when a job was last handled and how
/// long the current iteration took.
fn poll_delay(config: &PollConfig, last_job: Option<Instant>, now: Instant, spent: Duration) -> Duration {
    let busy = last_job.is_some_and(|at| now.saturating_duration_since(at) < config.cooldown);
    let period = if busy {
        config.min_poll_interval
    } else {
        config.max_poll_interval
    };
    period.saturating_sub(spent)
}

pub struct AnswerWorker<S, P> {
    source: Arc<S>,
    answerer: Arc<QuestionAnswerer<P>>,
    config: PollConfig,
    heartbeat: Arc<Heartbeat>,
    shutdown_rx: watch::Receiver<bool>,
    last_job: Option<Instant>,
    last_sync: Option<Instant>,
}

impl<S: JobSource, P: LlmProvider> AnswerWorker<S, P> {
    #[must_use]
    pub fn new(
        source: Arc<S>,
        answerer: Arc<QuestionAnswerer<P>>,
        config: PollConfig,
        heartbeat: Arc<Heartbeat>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            answerer,
            config,
            heartbeat,
            shutdown_rx,
            last_job: None,
            last_sync: None,
        }
    }

    /// Poll the job source until shutdown is signalled.
    pub async fn run(&mut self) {
        tracing::info!(
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "answer worker started"
        );
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            let started = Instant::now();
            self.sync_index(started).await;
            match self.poll_once().await {
                Ok(claimed) => {
                    if claimed > 0 {
                        self.last_job = Some(Instant::now());
                    }
                    self.heartbeat.beat().await;
                }
                Err(e) => tracing::warn!("failed to list pending jobs: {e}"),
            }

            let delay = poll_delay(&self.config, self.last_job, Instant::now(), started.elapsed());
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("answer worker shutting down");
    }

    /// Reload documents refreshed by another process once
    /// `index_sync_interval` has passed since the last sync.
    async fn sync_index(&mut self, now: Instant) {
        let due = self.last_sync.is_none_or(|at| {
            now.saturating_duration_since(at) >= self.config.index_sync_interval
        });
        if !due {
            return;
        }
        self.last_sync = Some(now);
        if let Err(e) = self.answerer.ranker().store().sync().await {
            tracing::warn!("index sync failed: {e}");
        }
    }

    /// Fetch one batch of pending jobs and process them concurrently.
    /// Returns how many jobs this worker claimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending jobs cannot be listed.
    pub async fn poll_once(&self) -> Result<usize, JobSourceError> {
        let jobs = self.source.list_pending(self.config.batch_size).await?;
        if jobs.is_empty() {
            return Ok(0);
        }
        tracing::debug!(pending = jobs.len(), "pending jobs found");

        let claimed = AtomicUsize::new(0);
        futures::stream::iter(jobs)
            .for_each_concurrent(self.config.max_concurrent_jobs.max(1), |job| {
                let claimed = &claimed;
                async move {
                    if self.process(job).await {
                        claimed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;
        Ok(claimed.into_inner())
    }

    /// Claim, answer and publish one job. Returns false when the claim was lost.
    async fn process(&self, job: Job) -> bool {
        match self.source.claim(&job.id).await {
            Ok(()) => {}
            Err(JobSourceError::Conflict(_)) => {
                tracing::debug!(job_id = %job.id, "job already claimed elsewhere");
                return false;
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, "failed to claim job: {e}");
                return false;
            }
        }
        tracing::info!(job_id = %job.id, "job claimed");

        let outcome = match self.answerer.answer(&job.question).await {
            Ok(answer) => {
                tracing::info!(
                    job_id = %job.id,
                    references = answer.references.len(),
                    "job answered"
                );
                JobOutcome::Answered(answer)
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, "job failed: {e}");
                JobOutcome::Failed {
                    message: self.answerer.failure_message(&e),
                }
            }
        };
        self.publish(&job.id, &outcome).await;
        self.heartbeat.beat().await;
        true
    }

    async fn publish(&self, id: &JobId, outcome: &JobOutcome) {
        for attempt in 0..PUBLISH_ATTEMPTS {
            match self.source.publish(id, outcome).await {
                Ok(()) => return,
                Err(e @ (JobSourceError::Conflict(_) | JobSourceError::NotFound(_))) => {
                    tracing::warn!(job_id = %id, "job outcome rejected: {e}");
                    return;
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, attempt = attempt + 1, "failed to publish job outcome: {e}");
                    if attempt + 1 < PUBLISH_ATTEMPTS {
                        tokio::time::sleep(exponential_backoff(
                            Duration::from_millis(200),
                            attempt,
                            Duration::from_secs(5),
                        ))
                        .await;
                    }
                }
            }
        }
        tracing::error!(
            job_id = %id,
            status = %outcome.status(),
            "giving up on publishing job outcome"
        );
    }
}
