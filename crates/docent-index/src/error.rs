//! Error types for docent-index.

use std::path::PathBuf;

/// Errors raised while building or querying the document index.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The embedding backend failed or returned an unusable vector.
    #[error("embedding failed for chunk {chunk}: {source}")]
    EmbeddingFailure {
        chunk: String,
        #[source]
        source: docent_llm::LlmError,
    },

    /// Persisted chunks and in-memory indices disagree for a document.
    #[error("index corruption in {path}: {reason}")]
    IndexCorruption { path: String, reason: String },

    /// A document could not be read from disk.
    #[error("failed to read {}: {source}", path.display())]
    DocumentRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A vector's length differs from the index dimension.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The document root does not exist or is not a directory.
    #[error("document root not found: {}", .0.display())]
    RootNotFound(PathBuf),

    /// Chunker settings are inconsistent.
    #[error("invalid chunker config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// LLM provider error outside of chunk embedding (e.g. query embedding).
    #[error("LLM error: {0}")]
    Llm(#[from] docent_llm::LlmError),

    #[error("integer conversion failed: {0}")]
    IntConversion(#[from] std::num::TryFromIntError),
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
