//! Keyword index on an FTS5 virtual table with BM25 ranking.
//!
//! Rows live in `chunks_fts` next to the `chunks` table and are written in
//! the same transaction as the chunk rows, so the index survives restarts
//! and every process sharing the database sees the same postings.

use sqlx::{SqliteConnection, SqlitePool};

use crate::error::Result;
use crate::types::ChunkId;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how",
    "i", "in", "is", "it", "my", "of", "on", "or", "that", "the", "this", "to", "what", "when",
    "where", "which", "who", "why", "with", "you",
];

/// Lowercase alphanumeric query terms, stopwords and duplicates removed,
/// in first-seen order.
#[must_use]
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !STOPWORDS.contains(&term.as_str()) && !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// FTS5 `MATCH` expression matching any of the query terms. Each term is
/// quoted so operators such as `NOT` or `NEAR` are searched literally.
fn match_expression(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

pub struct KeywordIndex {
    pool: SqlitePool,
}

impl std::fmt::Debug for KeywordIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeywordIndex").finish_non_exhaustive()
    }
}

/// Index `text` under `id` inside a caller's transaction.
pub(crate) async fn insert(conn: &mut SqliteConnection, id: &ChunkId, text: &str) -> Result<()> {
    sqlx::query("INSERT INTO chunks_fts (id, text) VALUES (?, ?)")
        .bind(id.as_str())
        .bind(text)
        .execute(conn)
        .await?;
    Ok(())
}

/// Drop the rows of every chunk persisted for `path`. Must run before the
/// chunk rows themselves are deleted.
pub(crate) async fn delete_document(conn: &mut SqliteConnection, path: &str) -> Result<()> {
    sqlx::query("DELETE FROM chunks_fts WHERE id IN (SELECT id FROM chunks WHERE path = ?)")
        .bind(path)
        .execute(conn)
        .await?;
    Ok(())
}

impl KeywordIndex {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the FTS table and its vocabulary view if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if a SQL statement fails.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                id UNINDEXED,
                text,
                tokenize = 'porter unicode61'
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts_vocab \
             USING fts5vocab(chunks_fts, instance)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the SQL query fails.
    pub async fn len(&self) -> Result<usize> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks_fts")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(n)?)
    }

    /// # Errors
    ///
    /// Returns an error if the SQL query fails.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// # Errors
    ///
    /// Returns an error if the SQL query fails.
    pub async fn contains(&self, id: &ChunkId) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT rowid FROM chunks_fts WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// # Errors
    ///
    /// Returns an error if the SQL query fails.
    pub async fn ids(&self) -> Result<Vec<ChunkId>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM chunks_fts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| ChunkId::from(id)).collect())
    }

    /// Sorted `(term, frequency)` postings of one chunk, after stemming.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL query fails.
    pub async fn terms(&self, id: &ChunkId) -> Result<Option<Vec<(String, u32)>>> {
        if !self.contains(id).await? {
            return Ok(None);
        }
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT term, COUNT(*) FROM chunks_fts_vocab \
             WHERE doc IN (SELECT rowid FROM chunks_fts WHERE id = ?) \
             GROUP BY term ORDER BY term",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(term, n)| Ok((term, u32::try_from(n)?)))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Index `text` under `id`, replacing any previous row for it.
    ///
    /// # Errors
    ///
    /// Returns an error if a SQL statement fails.
    pub async fn add(&self, id: &ChunkId, text: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        insert(&mut tx, id, text).await?;
        tx.commit().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the SQL statement fails.
    pub async fn remove(&self, id: &ChunkId) -> Result<bool> {
        let done = sqlx::query("DELETE FROM chunks_fts WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Up to `k` chunks by descending BM25 score, ties by ascending id.
    /// Chunks sharing no term with the query are not returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL query fails.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<(ChunkId, f64)>> {
        let Some(expr) = match_expression(query) else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, f64)> = sqlx::query_as(
            "SELECT id, bm25(chunks_fts) FROM chunks_fts WHERE chunks_fts MATCH ? \
             ORDER BY bm25(chunks_fts), id LIMIT ?",
        )
        .bind(expr)
        .bind(i64::try_from(k).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        // bm25() is lower-is-better
        Ok(rows
            .into_iter()
            .map(|(id, rank)| (ChunkId::from(id), -rank))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::connect;

    fn id(s: &str) -> ChunkId {
        ChunkId::from(s.to_owned())
    }

    async fn index() -> KeywordIndex {
        let index = KeywordIndex::new(connect(":memory:").await.unwrap());
        index.init().await.unwrap();
        index
    }

    #[test]
    fn query_terms_drop_stopwords_and_duplicates() {
        assert_eq!(
            query_terms("How do I submit a Batch job? Use `sbatch`, job & nodes."),
            ["submit", "batch", "job", "use", "sbatch", "nodes"]
        );
        assert_eq!(query_terms("slurm_conf GPUs"), ["slurm_conf", "gpus"]);
        assert!(query_terms("how do I").is_empty());
    }

    #[test]
    fn operators_are_quoted() {
        assert_eq!(
            match_expression("NOT near").unwrap(),
            "\"not\" OR \"near\""
        );
        assert!(match_expression("?!").is_none());
    }

    #[tokio::test]
    async fn matching_terms_rank_first() {
        let index = index().await;
        index.add(&id("a"), "Allocations: use sbatch for batch jobs.").await.unwrap();
        index.add(&id("b"), "Login nodes are shared between users.").await.unwrap();
        index.add(&id("c"), "Interactive jobs use salloc.").await.unwrap();

        let hits = index.search("how do I submit a batch job", 3).await.unwrap();
        assert_eq!(hits[0].0, id("a"));
        assert!(hits.iter().all(|(i, _)| *i != id("b")));
    }

    #[tokio::test]
    async fn more_overlap_scores_higher() {
        let index = index().await;
        index.add(&id("one"), "gpu nodes").await.unwrap();
        index.add(&id("two"), "gpu nodes with nvidia drivers").await.unwrap();
        index.add(&id("three"), "cpu partition").await.unwrap();
        let hits = index.search("nvidia gpu drivers", 3).await.unwrap();
        assert_eq!(hits[0].0, id("two"));
        assert_eq!(hits[1].0, id("one"));
        assert_eq!(hits.len(), 2);
        assert!(hits[0].1 > hits[1].1);
    }

    #[tokio::test]
    async fn identical_scores_tie_break_by_id() {
        let index = index().await;
        index.add(&id("b"), "quota").await.unwrap();
        index.add(&id("a"), "quota").await.unwrap();
        index.add(&id("c"), "quota").await.unwrap();
        let ids: Vec<_> = index
            .search("quota", 3)
            .await
            .unwrap()
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        assert_eq!(ids, [id("a"), id("b"), id("c")]);
    }

    #[tokio::test]
    async fn remove_drops_postings() {
        let index = index().await;
        index.add(&id("a"), "scratch filesystem purge").await.unwrap();
        index.add(&id("b"), "home filesystem quota").await.unwrap();
        assert!(index.remove(&id("a")).await.unwrap());
        assert!(!index.remove(&id("a")).await.unwrap());
        assert!(index.search("purge", 5).await.unwrap().is_empty());
        assert_eq!(index.len().await.unwrap(), 1);
        assert_eq!(index.ids().await.unwrap(), [id("b")]);
    }

    #[tokio::test]
    async fn re_adding_replaces_postings() {
        let index = index().await;
        index.add(&id("a"), "old words").await.unwrap();
        index.add(&id("a"), "new text").await.unwrap();
        assert!(index.search("old", 1).await.unwrap().is_empty());
        assert_eq!(
            index.terms(&id("a")).await.unwrap().unwrap(),
            [("new".into(), 1), ("text".into(), 1)]
        );
        assert!(index.terms(&id("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn plural_query_matches_singular_text() {
        let index = index().await;
        index.add(&id("a"), "submit a job with sbatch").await.unwrap();
        let hits = index.search("jobs", 1).await.unwrap();
        assert_eq!(hits[0].0, id("a"));
    }

    #[tokio::test]
    async fn search_is_deterministic() {
        let index = index().await;
        for i in 0..20 {
            index
                .add(&id(&format!("c{i:02}")), &format!("module load gcc version {i}"))
                .await
                .unwrap();
        }
        let first = index.search("load gcc", 10).await.unwrap();
        assert_eq!(first, index.search("load gcc", 10).await.unwrap());
        assert_eq!(first.len(), 10);
        assert!(index.search("load gcc", 0).await.unwrap().is_empty());
    }
}
