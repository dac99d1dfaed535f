use std::str::FromStr;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use super::JobSource;
use crate::error::JobSourceError;
use crate::job::{Job, JobId, JobOutcome, JobStatus};

type JobRow = (
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
);

/// Stored job as seen by `docent enqueue` and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub question: String,
    pub status: JobStatus,
    pub answer: Option<String>,
    pub sources: Vec<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub claimed_at: Option<String>,
    pub finished_at: Option<String>,
}

/// Job queue in a local `SQLite` table.
#[derive(Debug, Clone)]
pub struct SqliteJobSource {
    pool: SqlitePool,
    abandon_after: Option<Duration>,
}

fn row_id(id: &JobId) -> Result<i64, JobSourceError> {
    id.0.parse()
        .map_err(|_| JobSourceError::NotFound(id.0.clone()))
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl SqliteJobSource {
    /// Open the queue database at `path` (or `":memory:"`) and create the table.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub async fn open(path: &str) -> Result<Self, JobSourceError> {
        let pool = if path == ":memory:" {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await?
        } else {
            let opts = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(opts)
                .await?
        };
        Self::new(pool).await
    }

    /// # Errors
    ///
    /// Returns an error if the table cannot be created.
    pub async fn new(pool: SqlitePool) -> Result<Self, JobSourceError> {
        let source = Self {
            pool,
            abandon_after: None,
        };
        source.init().await?;
        Ok(source)
    }

    /// Return in-progress jobs older than `threshold` to pending whenever
    /// pending jobs are listed.
    #[must_use]
    pub fn with_abandon_after(mut self, threshold: Duration) -> Self {
        self.abandon_after = Some(threshold);
        self
    }

    async fn init(&self) -> Result<(), JobSourceError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                question TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                answer TEXT,
                sources TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                claimed_at TEXT,
                finished_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Add a pending question.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn enqueue(&self, question: &str) -> Result<JobId, JobSourceError> {
        let result = sqlx::query("INSERT INTO jobs (question, status, created_at) VALUES (?, ?, ?)")
            .bind(question)
            .bind(JobStatus::Pending.as_str())
            .bind(now())
            .execute(&self.pool)
            .await?;
        let id = JobId::from(result.last_insert_rowid());
        tracing::debug!(job = %id, "job enqueued");
        Ok(id)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or a stored row is malformed.
    pub async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, JobSourceError> {
        let Ok(rowid) = id.0.parse::<i64>() else {
            return Ok(None);
        };
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, question, status, answer, sources, error, created_at, claimed_at, \
             finished_at FROM jobs WHERE id = ?",
        )
        .bind(rowid)
        .fetch_optional(&self.pool)
        .await?;
        let Some((id, question, status, answer, sources, error, created_at, claimed_at, finished_at)) =
            row
        else {
            return Ok(None);
        };
        let status = JobStatus::from_str(&status).map_err(JobSourceError::Corrupt)?;
        let sources = match sources {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        Ok(Some(JobRecord {
            id: JobId::from(id),
            question,
            status,
            answer,
            sources,
            error,
            created_at,
            claimed_at,
            finished_at,
        }))
    }

    /// Move in-progress jobs claimed more than `threshold` ago back to pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn requeue_abandoned(&self, threshold: Duration) -> Result<u64, JobSourceError> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(threshold)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, claimed_at = NULL WHERE status = ? AND claimed_at < ?",
        )
        .bind(JobStatus::Pending.as_str())
        .bind(JobStatus::InProgress.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let requeued = result.rows_affected();
        if requeued > 0 {
            tracing::warn!(requeued, "returned abandoned jobs to the queue");
        }
        Ok(requeued)
    }
}

impl JobSource for SqliteJobSource {
    async fn list_pending(&self, limit: usize) -> Result<Vec<Job>, JobSourceError> {
        if let Some(threshold) = self.abandon_after {
            self.requeue_abandoned(threshold).await?;
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, question FROM jobs WHERE status = ? ORDER BY id LIMIT ?")
                .bind(JobStatus::Pending.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, question)| Job {
                id: JobId::from(id),
                question,
            })
            .collect())
    }

    async fn claim(&self, id: &JobId) -> Result<(), JobSourceError> {
        let rowid = row_id(id)?;
        let result =
            sqlx::query("UPDATE jobs SET status = ?, claimed_at = ? WHERE id = ? AND status = ?")
                .bind(JobStatus::InProgress.as_str())
                .bind(now())
                .bind(rowid)
                .bind(JobStatus::Pending.as_str())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM jobs WHERE id = ?")
            .bind(rowid)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(JobSourceError::Conflict(id.0.clone())),
            None => Err(JobSourceError::NotFound(id.0.clone())),
        }
    }

    async fn publish(&self, id: &JobId, outcome: &JobOutcome) -> Result<(), JobSourceError> {
        let rowid = row_id(id)?;
        let (answer, sources, error) = match outcome {
            JobOutcome::Answered(answer) => (
                Some(answer.text.as_str()),
                Some(serde_json::to_string(&answer.sources)?),
                None,
            ),
            JobOutcome::Failed { message } => (Some(message.as_str()), None, Some(message.as_str())),
        };
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, answer = ?, sources = ?, error = ?, finished_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(outcome.status().as_str())
        .bind(answer)
        .bind(sources)
        .bind(error)
        .bind(now())
        .bind(rowid)
        .bind(JobStatus::InProgress.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(JobSourceError::Conflict(id.0.clone()))
        }
    }
}
