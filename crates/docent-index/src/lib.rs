//! Document indexing and hybrid retrieval.
//!
//! [`Updater`] walks a document tree, splits each stale document with
//! [`Chunker`], embeds new chunks and persists them in [`ChunkStore`], which
//! keeps an [`EmbeddingIndex`] and a [`KeywordIndex`] in lock-step with the
//! database. [`HybridRanker`] queries both indices and fuses the results.

pub mod chunker;
pub mod embedding;
pub mod error;
pub mod keyword;
pub mod ranker;
pub mod source_url;
pub mod store;
pub mod types;
pub mod updater;

pub use chunker::{Chunker, ChunkerConfig};
pub use embedding::EmbeddingIndex;
pub use error::{IndexError, Result};
pub use keyword::KeywordIndex;
pub use ranker::{HybridRanker, RankerConfig, reciprocal_rank_fusion};
pub use source_url::SourceUrls;
pub use store::ChunkStore;
pub use types::{Chunk, ChunkId, ChunkRecord, RankedResult, ScoredChunk};
pub use updater::{RefreshOutcome, RefreshReport, Updater};
