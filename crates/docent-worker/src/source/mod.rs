//! Where questions come from and where answers go.

mod http;
mod sqlite;

use std::future::Future;

pub use http::HttpJobSource;
pub use sqlite::{JobRecord, SqliteJobSource};

use crate::error::JobSourceError;
use crate::job::{Job, JobId, JobOutcome};

/// Queue of pending questions shared by any number of workers.
///
/// `claim` must be atomic across workers: at most one caller wins for a
/// given job, every other caller gets [`JobSourceError::Conflict`].
pub trait JobSource: Send + Sync {
    /// Up to `limit` pending jobs, oldest first.
    fn list_pending(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job>, JobSourceError>> + Send;

    /// Move a pending job to in-progress on behalf of this worker.
    fn claim(&self, id: &JobId) -> impl Future<Output = Result<(), JobSourceError>> + Send;

    /// Record the terminal state of a job previously claimed.
    fn publish(
        &self,
        id: &JobId,
        outcome: &JobOutcome,
    ) -> impl Future<Output = Result<(), JobSourceError>> + Send;
}

/// Job source selected by configuration.
#[derive(Debug, Clone)]
pub enum AnyJobSource {
    Sqlite(SqliteJobSource),
    Http(HttpJobSource),
}

impl JobSource for AnyJobSource {
    async fn list_pending(&self, limit: usize) -> Result<Vec<Job>, JobSourceError> {
        match self {
            Self::Sqlite(s) => s.list_pending(limit).await,
            Self::Http(s) => s.list_pending(limit).await,
        }
    }

    async fn claim(&self, id: &JobId) -> Result<(), JobSourceError> {
        match self {
            Self::Sqlite(s) => s.claim(id).await,
            Self::Http(s) => s.claim(id).await,
        }
    }

    async fn publish(&self, id: &JobId, outcome: &JobOutcome) -> Result<(), JobSourceError> {
        match self {
            Self::Sqlite(s) => s.publish(id, outcome).await,
            Self::Http(s) => s.publish(id, outcome).await,
        }
    }
}
