use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Index key of a chunk: hex blake3 of (document path, sequence index, text).
///
/// Re-chunking an unchanged document yields the same ids, so stored vectors
/// can be reused and unrelated documents keep their entries across refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    #[must_use]
    pub fn derive(path: &str, seq: usize, text: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(path.as_bytes());
        hasher.update(&[0]);
        hasher.update(&(seq as u64).to_le_bytes());
        hasher.update(&[0]);
        hasher.update(text.as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ChunkId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bounded span of a document used as the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    /// Document path relative to the document root, `/`-separated.
    pub path: String,
    pub seq: usize,
    pub text: String,
    /// Byte offset of the first character in the source document.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// Nearest preceding markdown heading, if any.
    pub heading: Option<String>,
    pub url: String,
    /// blake3 of `text` alone, used to reuse vectors when a chunk only moved.
    pub content_hash: String,
}

/// Persisted chunk with its vector and the parent document's modification time.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
    pub modified_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: std::sync::Arc<Chunk>,
    pub score: f64,
}

/// Ordered retrieval result, descending by score with ties by ascending chunk id.
pub type RankedResult = Vec<ScoredChunk>;

#[must_use]
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Milliseconds since the Unix epoch; times before the epoch clamp to zero.
#[must_use]
pub fn to_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
