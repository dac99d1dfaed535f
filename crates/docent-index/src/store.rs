//! `SQLite` persistence for chunks, vectors and keyword postings.
//!
//! The database is the source of truth. Chunk rows and their [`KeywordIndex`]
//! rows are written in one transaction. On open every persisted chunk is
//! loaded into memory and the [`EmbeddingIndex`]; afterwards each document
//! write updates the database first and then swaps the document's chunks in
//! memory one at a time.
//!
//! Every document write bumps the document's `revision`. A process that did
//! not perform the write catches up with [`ChunkStore::sync`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::embedding::EmbeddingIndex;
use crate::error::{IndexError, Result};
use crate::keyword::{self, KeywordIndex};
use crate::types::{Chunk, ChunkId, ChunkRecord};

type ChunkRow = (
    String,
    String,
    i64,
    String,
    i64,
    i64,
    Option<String>,
    String,
    String,
    Vec<u8>,
);

const SELECT_CHUNKS: &str = "SELECT c.id, c.path, c.seq, c.text, c.start_offset, c.end_offset, \
     c.heading, c.url, c.content_hash, c.embedding FROM chunks c";

/// Open (or create) the index database. `":memory:"` yields a private
/// single-connection in-memory database.
///
/// # Errors
///
/// Returns an error if the database cannot be opened.
pub async fn connect(path: &str) -> Result<SqlitePool> {
    if path == ":memory:" {
        return Ok(SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?);
    }
    let opts = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    Ok(SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(opts)
        .await?)
}

pub struct ChunkStore {
    pool: SqlitePool,
    chunks: RwLock<HashMap<ChunkId, Arc<Chunk>>>,
    /// Revision of each document as last loaded into memory.
    revisions: RwLock<HashMap<String, i64>>,
    embeddings: EmbeddingIndex,
    keywords: KeywordIndex,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("chunks", &self.len())
            .field("embeddings", &self.embeddings)
            .field("keywords", &self.keywords)
            .finish_non_exhaustive()
    }
}

fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// Decode a row, checking that it still matches its derived identifier.
fn decode_row(row: ChunkRow) -> std::result::Result<(Chunk, Vec<f32>), String> {
    let (id, path, seq, text, start, end, heading, url, content_hash, blob) = row;
    let seq = usize::try_from(seq).map_err(|_| format!("negative seq for {id}"))?;
    let start = usize::try_from(start).map_err(|_| format!("negative offset for {id}"))?;
    let end = usize::try_from(end).map_err(|_| format!("negative offset for {id}"))?;
    let vector = decode_vector(&blob).ok_or_else(|| format!("truncated vector for {id}"))?;
    if vector.is_empty() {
        return Err(format!("missing vector for {id}"));
    }
    let id = ChunkId::from(id);
    if ChunkId::derive(&path, seq, &text) != id {
        return Err(format!("chunk {id} does not match its content"));
    }
    Ok((
        Chunk {
            id,
            path,
            seq,
            text,
            start,
            end,
            heading,
            url,
            content_hash,
        },
        vector,
    ))
}

impl ChunkStore {
    /// Create the tables if needed and load every persisted chunk into memory.
    ///
    /// Documents whose rows fail to decode, or whose vectors disagree with
    /// the index dimension, are dropped so the next refresh re-indexes them.
    ///
    /// # Errors
    ///
    /// Returns an error if a SQL statement fails.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        let store = Self {
            keywords: KeywordIndex::new(pool.clone()),
            pool,
            chunks: RwLock::new(HashMap::new()),
            revisions: RwLock::new(HashMap::new()),
            embeddings: EmbeddingIndex::new(),
        };
        store.init().await?;
        store.load().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                modified_at INTEGER NOT NULL,
                revision INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                seq INTEGER NOT NULL,
                text TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                heading TEXT,
                url TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                embedding BLOB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path)")
            .execute(&self.pool)
            .await?;
        self.keywords.init().await
    }

    async fn load(&self) -> Result<()> {
        let revisions = self.stored_revisions().await?;
        let rows: Vec<ChunkRow> =
            sqlx::query_as(&format!("{SELECT_CHUNKS} ORDER BY c.path, c.seq"))
                .fetch_all(&self.pool)
                .await?;

        let mut by_path: BTreeMap<String, Vec<ChunkRow>> = BTreeMap::new();
        for row in rows {
            by_path.entry(row.1.clone()).or_default().push(row);
        }

        let mut corrupt: Vec<(String, String)> = Vec::new();
        for (path, rows) in by_path {
            if !revisions.contains_key(&path) {
                corrupt.push((path, "chunks without a document record".into()));
                continue;
            }
            let decoded: std::result::Result<Vec<_>, String> =
                rows.into_iter().map(decode_row).collect();
            let entries = match decoded {
                Ok(entries) => entries,
                Err(reason) => {
                    corrupt.push((path, reason));
                    continue;
                }
            };
            if let Some(Err(e)) = entries
                .iter()
                .map(|(_, v)| self.embeddings.check_dimension(v))
                .find(Result::is_err)
            {
                corrupt.push((path, e.to_string()));
                continue;
            }
            if let Err(e) = self.insert_in_memory(entries) {
                self.purge_in_memory(&path);
                corrupt.push((path, e.to_string()));
            }
        }
        *self.revisions.write().unwrap_or_else(PoisonError::into_inner) = revisions;

        for (path, reason) in corrupt {
            let err = IndexError::IndexCorruption {
                path: path.clone(),
                reason,
            };
            tracing::error!(path = %path, "{err}; dropping document for re-index");
            self.delete_rows(&path).await?;
            self.forget_revision(&path);
        }

        tracing::debug!(chunks = self.len(), "chunk store loaded");
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[must_use]
    pub fn embedding_index(&self) -> &EmbeddingIndex {
        &self.embeddings
    }

    #[must_use]
    pub fn keyword_index(&self) -> &KeywordIndex {
        &self.keywords
    }

    /// Number of chunks visible to retrieval.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, id: &ChunkId) -> Option<Arc<Chunk>> {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All known documents and their stored modification times.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL query fails.
    pub async fn documents(&self) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT path, modified_at FROM documents")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn stored_revisions(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT path, revision FROM documents")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// True when `path` has no record or its stored time is older than `modified_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL query fails.
    pub async fn is_stale(&self, path: &str, modified_at: i64) -> Result<bool> {
        let stored: Option<(i64,)> =
            sqlx::query_as("SELECT modified_at FROM documents WHERE path = ?")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(stored.is_none_or(|(t,)| t < modified_at))
    }

    /// Persisted chunks of `path` in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL query fails or a row is corrupt.
    pub async fn chunks_for(&self, path: &str) -> Result<Vec<ChunkRecord>> {
        let modified_at: Option<(i64,)> =
            sqlx::query_as("SELECT modified_at FROM documents WHERE path = ?")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        let Some((modified_at,)) = modified_at else {
            return Ok(Vec::new());
        };
        let rows: Vec<ChunkRow> =
            sqlx::query_as(&format!("{SELECT_CHUNKS} WHERE c.path = ? ORDER BY c.seq"))
                .bind(path)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|row| {
                decode_row(row)
                    .map(|(chunk, vector)| ChunkRecord {
                        chunk,
                        vector,
                        modified_at,
                    })
                    .map_err(|reason| IndexError::IndexCorruption {
                        path: path.to_owned(),
                        reason,
                    })
            })
            .collect()
    }

    /// Replace every chunk of `path` with `entries` and record `modified_at`.
    ///
    /// Chunk rows, keyword rows and the document record are updated in one
    /// transaction. In memory, new chunks are added before the document's
    /// superseded chunks are removed.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` before touching anything if a vector has the
    /// wrong length, or a database error.
    pub async fn upsert_document(
        &self,
        path: &str,
        modified_at: i64,
        entries: Vec<(Chunk, Vec<f32>)>,
    ) -> Result<()> {
        if let Some((_, first)) = entries.first() {
            self.embeddings.check_dimension(first)?;
            if let Some((_, v)) = entries.iter().find(|(_, v)| v.len() != first.len()) {
                return Err(IndexError::DimensionMismatch {
                    expected: first.len(),
                    actual: v.len(),
                });
            }
        }

        let mut tx = self.pool.begin().await?;
        keyword::delete_document(&mut tx, path).await?;
        sqlx::query("DELETE FROM chunks WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        for (chunk, vector) in &entries {
            sqlx::query(
                "INSERT OR REPLACE INTO chunks \
                 (id, path, seq, text, start_offset, end_offset, heading, url, content_hash, embedding) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(chunk.id.as_str())
            .bind(path)
            .bind(i64::try_from(chunk.seq)?)
            .bind(&chunk.text)
            .bind(i64::try_from(chunk.start)?)
            .bind(i64::try_from(chunk.end)?)
            .bind(chunk.heading.as_deref())
            .bind(&chunk.url)
            .bind(&chunk.content_hash)
            .bind(encode_vector(vector))
            .execute(&mut *tx)
            .await?;
            keyword::insert(&mut tx, &chunk.id, &chunk.text).await?;
        }
        let (revision,): (i64,) = sqlx::query_as(
            "INSERT INTO documents (path, modified_at) VALUES (?, ?) \
             ON CONFLICT(path) DO UPDATE SET modified_at = excluded.modified_at, \
             revision = documents.revision + 1 \
             RETURNING revision",
        )
        .bind(path)
        .bind(modified_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        self.swap_document(path, revision, entries)
    }

    /// Delete `path` and all its chunks from the database and the indices.
    /// Returns the number of chunks removed.
    ///
    /// # Errors
    ///
    /// Returns an error if a SQL statement fails.
    pub async fn remove_document(&self, path: &str) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks WHERE path = ?")
            .bind(path)
            .fetch_one(&self.pool)
            .await?;
        self.delete_rows(path).await?;
        self.purge_in_memory(path);
        self.forget_revision(path);
        Ok(usize::try_from(count)?)
    }

    /// Reload every document whose revision in the database differs from
    /// the one in memory, and drop documents that no longer exist there.
    ///
    /// Picks up refreshes performed through another connection or process.
    /// A document that fails to reload is logged and left out of memory.
    /// Returns the number of documents reloaded or dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the revision query fails.
    pub async fn sync(&self) -> Result<usize> {
        let stored = self.stored_revisions().await?;
        let loaded = self
            .revisions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut changed = 0;
        for path in loaded.keys().filter(|p| !stored.contains_key(*p)) {
            self.purge_in_memory(path);
            self.forget_revision(path);
            changed += 1;
        }
        for (path, revision) in &stored {
            if loaded.get(path) == Some(revision) {
                continue;
            }
            changed += 1;
            if let Err(e) = self.reload_document(path).await {
                tracing::error!(path = %path, "reload failed: {e}");
            }
        }

        if changed > 0 {
            tracing::info!(documents = changed, chunks = self.len(), "index synchronised");
        }
        Ok(changed)
    }

    async fn reload_document(&self, path: &str) -> Result<()> {
        // one read transaction so the revision matches the rows
        let mut tx = self.pool.begin().await?;
        let revision: Option<(i64,)> =
            sqlx::query_as("SELECT revision FROM documents WHERE path = ?")
                .bind(path)
                .fetch_optional(&mut *tx)
                .await?;
        let rows: Vec<ChunkRow> =
            sqlx::query_as(&format!("{SELECT_CHUNKS} WHERE c.path = ? ORDER BY c.seq"))
                .bind(path)
                .fetch_all(&mut *tx)
                .await?;
        tx.commit().await?;

        let Some((revision,)) = revision else {
            self.purge_in_memory(path);
            self.forget_revision(path);
            return Ok(());
        };
        let decoded: std::result::Result<Vec<_>, String> =
            rows.into_iter().map(decode_row).collect();
        match decoded {
            Ok(entries) => self.swap_document(path, revision, entries),
            Err(reason) => {
                self.purge_in_memory(path);
                self.set_revision(path, revision);
                Err(IndexError::IndexCorruption {
                    path: path.to_owned(),
                    reason,
                })
            }
        }
    }

    /// Check that the chunk map, the embedding index and the keyword table
    /// hold the same ids.
    ///
    /// Stray index entries are dropped. Documents with a chunk missing from
    /// either index are purged from memory and marked stale so the next
    /// refresh rebuilds them. Returns the affected document paths.
    ///
    /// # Errors
    ///
    /// Returns an error if a SQL statement fails.
    pub async fn verify(&self) -> Result<Vec<String>> {
        let chunk_ids: HashMap<ChunkId, String> = self
            .chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, c)| (id.clone(), c.path.clone()))
            .collect();
        let embedded: HashSet<ChunkId> = self.embeddings.ids().into_iter().collect();

        for stray in &embedded {
            if !chunk_ids.contains_key(stray) {
                tracing::error!(chunk = %stray, "vector without chunk record, removing");
                self.embeddings.remove(stray);
            }
        }
        let stray_keywords =
            sqlx::query("DELETE FROM chunks_fts WHERE id NOT IN (SELECT id FROM chunks)")
                .execute(&self.pool)
                .await?
                .rows_affected();
        if stray_keywords > 0 {
            tracing::error!(rows = stray_keywords, "keyword rows without chunk record, removed");
        }
        let unkeyed: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT path FROM chunks WHERE id NOT IN (SELECT id FROM chunks_fts)",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut damaged: Vec<String> = chunk_ids
            .iter()
            .filter(|(id, _)| !embedded.contains(*id))
            .map(|(_, path)| path.clone())
            .chain(unkeyed.into_iter().map(|(path,)| path))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        damaged.sort();

        for path in &damaged {
            let err = IndexError::IndexCorruption {
                path: path.clone(),
                reason: "chunk missing from an index".into(),
            };
            tracing::error!(path = %path, "{err}; scheduling re-index");
            self.purge_in_memory(path);
            sqlx::query("UPDATE documents SET modified_at = 0 WHERE path = ?")
                .bind(path)
                .execute(&self.pool)
                .await?;
        }
        Ok(damaged)
    }

    async fn delete_rows(&self, path: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        keyword::delete_document(&mut tx, path).await?;
        sqlx::query("DELETE FROM chunks WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Make `entries` the in-memory chunks of `path` at `revision`: new
    /// chunks are added first, then the superseded ones removed.
    fn swap_document(
        &self,
        path: &str,
        revision: i64,
        entries: Vec<(Chunk, Vec<f32>)>,
    ) -> Result<()> {
        let new_ids: HashSet<&ChunkId> = entries.iter().map(|(c, _)| &c.id).collect();
        let superseded: Vec<ChunkId> = self
            .chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.path == path && !new_ids.contains(&c.id))
            .map(|c| c.id.clone())
            .collect();

        self.set_revision(path, revision);
        if let Err(e) = self.insert_in_memory(entries) {
            self.purge_in_memory(path);
            return Err(IndexError::IndexCorruption {
                path: path.to_owned(),
                reason: e.to_string(),
            });
        }
        for id in &superseded {
            self.remove_in_memory(id);
        }
        Ok(())
    }

    fn set_revision(&self, path: &str, revision: i64) {
        self.revisions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_owned(), revision);
    }

    fn forget_revision(&self, path: &str) {
        self.revisions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    fn insert_in_memory(&self, entries: Vec<(Chunk, Vec<f32>)>) -> Result<()> {
        for (chunk, vector) in entries {
            let chunk = Arc::new(chunk);
            self.chunks
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(chunk.id.clone(), Arc::clone(&chunk));
            self.embeddings.add(chunk.id.clone(), vector)?;
        }
        Ok(())
    }

    fn remove_in_memory(&self, id: &ChunkId) {
        self.embeddings.remove(id);
        self.chunks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn purge_in_memory(&self, path: &str) {
        let ids: Vec<ChunkId> = self
            .chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.path == path)
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            self.remove_in_memory(id);
        }
    }
}
