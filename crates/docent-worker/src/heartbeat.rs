//! Last-activity timestamp for external liveness checks.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

#[derive(Debug)]
pub struct Heartbeat {
    last_millis: AtomicI64,
    path: Option<PathBuf>,
}

impl Heartbeat {
    /// In-memory heartbeat, mirrored to `path` on every beat when set.
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            last_millis: AtomicI64::new(Utc::now().timestamp_millis()),
            path,
        }
    }

    pub async fn beat(&self) {
        let now = Utc::now();
        self.last_millis
            .store(now.timestamp_millis(), Ordering::Relaxed);
        if let Some(path) = &self.path
            && let Err(e) = tokio::fs::write(path, now.to_rfc3339_opts(SecondsFormat::Millis, true)).await
        {
            tracing::warn!(path = %path.display(), "failed to write heartbeat: {e}");
        }
    }

    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_millis.load(Ordering::Relaxed))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    #[must_use]
    pub fn is_stale(&self, max_age: Duration) -> bool {
        is_older_than(self.last_activity(), max_age)
    }
}

fn is_older_than(at: DateTime<Utc>, max_age: Duration) -> bool {
    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    Utc::now().signed_duration_since(at) > max_age
}

/// Timestamp stored in a heartbeat file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold an RFC 3339 timestamp.
pub async fn read_heartbeat(path: &Path) -> std::io::Result<DateTime<Utc>> {
    let raw = tokio::fs::read_to_string(path).await?;
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Whether the worker owning `path` has shown activity within `max_age`.
///
/// # Errors
///
/// Returns an error if the heartbeat file cannot be read.
pub async fn check_heartbeat(path: &Path, max_age: Duration) -> std::io::Result<bool> {
    Ok(!is_older_than(read_heartbeat(path).await?, max_age))
}
