//! Answer worker: claims pending questions from a job source, answers them
//! from the documentation index and publishes the result.

pub mod answer;
pub mod error;
pub mod heartbeat;
pub mod job;
pub mod prompt;
pub mod source;
#[cfg(test)]
mod test_support;
pub mod worker;

pub use answer::{AnswerConfig, QuestionAnswerer};
pub use error::{JobSourceError, Result, WorkerError};
pub use heartbeat::Heartbeat;
pub use job::{Answer, Job, JobId, JobOutcome, JobStatus};
pub use source::{AnyJobSource, HttpJobSource, JobRecord, JobSource, SqliteJobSource};
pub use worker::{AnswerWorker, PollConfig};
