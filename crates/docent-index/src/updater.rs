//! Incremental, single-flight refresh of the index from a document tree.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use docent_llm::LlmProvider;

use crate::chunker::Chunker;
use crate::error::{IndexError, Result};
use crate::store::ChunkStore;
use crate::types::{Chunk, ChunkRecord, to_millis};

/// Summary of one refresh.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub documents_scanned: usize,
    pub documents_updated: usize,
    pub documents_unchanged: usize,
    pub documents_removed: usize,
    pub documents_failed: usize,
    pub chunks_embedded: usize,
    pub chunks_reused: usize,
    pub chunks_skipped: usize,
    /// Documents found inconsistent at the start of the refresh.
    pub documents_repaired: usize,
    /// Documents missing from the walk but kept because their directory
    /// could not be read.
    pub documents_retained: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed(RefreshReport),
    /// Another refresh held the lock; nothing was done.
    AlreadyRunning,
}

/// Parts of the tree the walk could not read. Documents there are missing
/// from the walk without having been deleted.
#[derive(Debug, Default)]
struct WalkFailures {
    /// Relative paths that failed; `""` is the root itself.
    paths: Vec<String>,
    /// An error without a path: no missing document is known to be deleted.
    unlocated: bool,
}

impl WalkFailures {
    fn record(&mut self, root: &Path, err: &ignore::Error) {
        match error_path(err) {
            Some(path) => self.paths.push(relative_path(root, path)),
            None => self.unlocated = true,
        }
    }

    fn is_empty(&self) -> bool {
        self.paths.is_empty() && !self.unlocated
    }

    /// True when `rel_path` may exist below a part of the tree that failed.
    fn covers(&self, rel_path: &str) -> bool {
        self.unlocated
            || self.paths.iter().any(|p| {
                p.is_empty()
                    || rel_path == p
                    || rel_path
                        .strip_prefix(p.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }
}

fn error_path(err: &ignore::Error) -> Option<&Path> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path),
        ignore::Error::Loop { child, .. } => Some(child),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        _ => None,
    }
}

/// `path` relative to `root` with `/` separators.
fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Stored documents to delete: those not seen by the walk and not under a
/// part of the tree the walk failed to read.
fn deleted_documents(
    stored: impl IntoIterator<Item = String>,
    seen: &HashSet<String>,
    failures: &WalkFailures,
) -> (Vec<String>, usize) {
    let mut retained = 0;
    let deleted = stored
        .into_iter()
        .filter(|path| !seen.contains(path))
        .filter(|path| {
            let covered = failures.covers(path);
            retained += usize::from(covered);
            !covered
        })
        .collect();
    (deleted, retained)
}

enum DocumentOutcome {
    Unchanged,
    Updated {
        embedded: usize,
        reused: usize,
        skipped: usize,
    },
}

pub struct Updater<P> {
    store: Arc<ChunkStore>,
    provider: Arc<P>,
    chunker: Chunker,
    extensions: Vec<String>,
    running: tokio::sync::Mutex<()>,
}

impl<P: LlmProvider> Updater<P> {
    /// `extensions` lists the file suffixes (without dot) that are indexed.
    #[must_use]
    pub fn new(
        store: Arc<ChunkStore>,
        provider: Arc<P>,
        chunker: Chunker,
        extensions: Vec<String>,
    ) -> Self {
        Self {
            store,
            provider,
            chunker,
            extensions,
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Bring the index up to date with the documents under `root`.
    ///
    /// Returns `AlreadyRunning` immediately if another refresh is in progress.
    /// Failures of individual documents are logged and counted; they never
    /// abort the refresh.
    ///
    /// # Errors
    ///
    /// Returns `RootNotFound` if `root` is not a directory, or a database
    /// error from listing or garbage-collecting documents.
    pub async fn refresh(&self, root: &Path) -> Result<RefreshOutcome> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::info!(root = %root.display(), "refresh already running, skipping");
            return Ok(RefreshOutcome::AlreadyRunning);
        };
        if !root.is_dir() {
            return Err(IndexError::RootNotFound(root.to_path_buf()));
        }

        let start = Instant::now();
        let mut report = RefreshReport {
            documents_repaired: self.store.verify().await?.len(),
            ..RefreshReport::default()
        };

        let (files, failures) = self.collect_files(root);
        tracing::info!(root = %root.display(), files = files.len(), "refresh started");
        if !failures.is_empty() {
            tracing::warn!(
                paths = failures.paths.len(),
                unlocated = failures.unlocated,
                "document tree only partially readable"
            );
        }
        if failures.unlocated {
            report.errors.push("walk: error without a path, deleted documents kept".into());
        }
        for path in &failures.paths {
            report.errors.push(format!("walk: {path} unreadable, documents below it kept"));
        }

        let mut seen: HashSet<String> = HashSet::with_capacity(files.len());
        for (rel_path, abs_path) in &files {
            report.documents_scanned += 1;
            seen.insert(rel_path.clone());

            match self.refresh_document(rel_path, abs_path).await {
                Ok(DocumentOutcome::Unchanged) => report.documents_unchanged += 1,
                Ok(DocumentOutcome::Updated {
                    embedded,
                    reused,
                    skipped,
                }) => {
                    report.documents_updated += 1;
                    report.chunks_embedded += embedded;
                    report.chunks_reused += reused;
                    report.chunks_skipped += skipped;
                    tracing::debug!(path = %rel_path, embedded, reused, skipped, "document indexed");
                }
                Err(e) => {
                    tracing::warn!(path = %rel_path, "document skipped: {e}");
                    report.documents_failed += 1;
                    report.errors.push(format!("{rel_path}: {e}"));
                }
            }
        }

        let (deleted, retained) =
            deleted_documents(self.store.documents().await?.into_keys(), &seen, &failures);
        if retained > 0 {
            tracing::warn!(documents = retained, "walk incomplete, keeping unseen documents");
        }
        report.documents_retained = retained;
        for path in deleted {
            match self.store.remove_document(&path).await {
                Ok(n) => {
                    report.documents_removed += 1;
                    tracing::info!(path = %path, chunks = n, "removed deleted document");
                }
                Err(e) => {
                    tracing::warn!(path = %path, "cleanup failed: {e}");
                    report.errors.push(format!("cleanup {path}: {e}"));
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        tracing::info!(
            scanned = report.documents_scanned,
            updated = report.documents_updated,
            unchanged = report.documents_unchanged,
            removed = report.documents_removed,
            retained = report.documents_retained,
            failed = report.documents_failed,
            embedded = report.chunks_embedded,
            reused = report.chunks_reused,
            skipped = report.chunks_skipped,
            duration_ms = report.duration_ms,
            "refresh finished"
        );
        Ok(RefreshOutcome::Completed(report))
    }

    /// Indexable files under `root` as `(relative path, absolute path)`,
    /// sorted, and the parts of the tree that could not be read.
    fn collect_files(&self, root: &Path) -> (Vec<(String, PathBuf)>, WalkFailures) {
        let mut failures = WalkFailures::default();
        let mut files: Vec<(String, PathBuf)> = ignore::WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(true)
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("walk error: {e}");
                    failures.record(root, &e);
                    None
                }
            })
            .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()) && self.is_indexable(e.path()))
            .map(|e| (relative_path(root, e.path()), e.into_path()))
            .collect();
        files.sort();
        (files, failures)
    }

    fn is_indexable(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
    }

    async fn refresh_document(&self, rel_path: &str, abs_path: &Path) -> Result<DocumentOutcome> {
        let read_err = |source| IndexError::DocumentRead {
            path: abs_path.to_path_buf(),
            source,
        };
        let modified = tokio::fs::metadata(abs_path)
            .await
            .and_then(|m| m.modified())
            .map_err(read_err)?;
        let modified_at = to_millis(modified);

        if !self.store.is_stale(rel_path, modified_at).await? {
            return Ok(DocumentOutcome::Unchanged);
        }

        let text = tokio::fs::read_to_string(abs_path).await.map_err(read_err)?;
        let chunks = self.chunker.split(rel_path, &text);
        let previous = self.store.chunks_for(rel_path).await.unwrap_or_else(|e| {
            tracing::warn!(path = %rel_path, "previous chunks unreadable, re-embedding: {e}");
            Vec::new()
        });

        let (entries, embedded, reused, skipped) = self.embed_chunks(chunks, previous).await;

        // A skipped chunk leaves the document incomplete: store it as
        // never-modified so the next refresh retries it.
        let recorded_at = if skipped > 0 { 0 } else { modified_at };
        self.store
            .upsert_document(rel_path, recorded_at, entries)
            .await?;

        Ok(DocumentOutcome::Updated {
            embedded,
            reused,
            skipped,
        })
    }

    async fn embed_chunks(
        &self,
        chunks: Vec<Chunk>,
        previous: Vec<ChunkRecord>,
    ) -> (Vec<(Chunk, Vec<f32>)>, usize, usize, usize) {
        let mut by_hash: HashMap<String, Vec<f32>> = HashMap::with_capacity(previous.len());
        for record in previous {
            by_hash.insert(record.chunk.content_hash, record.vector);
        }

        let mut entries = Vec::with_capacity(chunks.len());
        let (mut embedded, mut reused, mut skipped) = (0, 0, 0);
        for chunk in chunks {
            if let Some(vector) = by_hash.get(&chunk.content_hash) {
                reused += 1;
                entries.push((chunk, vector.clone()));
                continue;
            }
            match self.provider.embed(&chunk.text).await {
                Ok(vector) if !vector.is_empty() => {
                    embedded += 1;
                    entries.push((chunk, vector));
                }
                Ok(_) => {
                    skipped += 1;
                    tracing::warn!(chunk = %chunk.id, path = %chunk.path, "empty embedding, chunk skipped");
                }
                Err(source) => {
                    skipped += 1;
                    let err = IndexError::EmbeddingFailure {
                        chunk: chunk.id.to_string(),
                        source,
                    };
                    tracing::warn!(path = %chunk.path, "{err}");
                }
            }
        }
        (entries, embedded, reused, skipped)
    }
}
