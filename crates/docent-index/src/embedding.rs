//! Exact cosine nearest-neighbour index over chunk vectors.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{IndexError, Result};
use crate::types::ChunkId;

struct Entry {
    vector: Arc<[f32]>,
    norm: f32,
}

#[derive(Default)]
struct Inner {
    dimension: Option<usize>,
    entries: HashMap<ChunkId, Entry>,
}

/// Every insert or removal takes the write lock for a single chunk, so a
/// concurrent search sees each chunk either before or after the change.
#[derive(Default)]
pub struct EmbeddingIndex {
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for EmbeddingIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingIndex")
            .field("len", &self.len())
            .field("dimension", &self.dimension())
            .finish()
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

impl EmbeddingIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dimension fixed by the first vector added; `None` while empty.
    #[must_use]
    pub fn dimension(&self) -> Option<usize> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dimension
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &ChunkId) -> Option<Arc<[f32]>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(id)
            .map(|e| Arc::clone(&e.vector))
    }

    /// Check a vector against the index dimension without inserting it.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if the index already holds vectors of another length.
    pub fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        match self.dimension() {
            Some(expected) if expected != vector.len() => Err(IndexError::DimensionMismatch {
                expected,
                actual: vector.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Insert or replace the vector for `id`.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if `vector` differs in length from the
    /// vectors already indexed.
    pub fn add(&self, id: ChunkId, vector: Vec<f32>) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.dimension {
            Some(expected) if expected != vector.len() => {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
            Some(_) => {}
            None => inner.dimension = Some(vector.len()),
        }
        let norm = norm(&vector);
        inner.entries.insert(
            id,
            Entry {
                vector: vector.into(),
                norm,
            },
        );
        Ok(())
    }

    /// Returns whether `id` was present. Removing the last vector resets the dimension.
    pub fn remove(&self, id: &ChunkId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.entries.remove(id).is_some();
        if inner.entries.is_empty() {
            inner.dimension = None;
        }
        removed
    }

    #[must_use]
    pub fn ids(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .keys()
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Up to `k` chunks by descending cosine similarity, ties by ascending id.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if the query length differs from the index dimension.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(ChunkId, f32)>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if k == 0 || inner.entries.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(expected) = inner.dimension
            && expected != query.len()
        {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: query.len(),
            });
        }

        let query_norm = norm(query);
        let mut scored: Vec<(ChunkId, f32)> = inner
            .entries
            .iter()
            .map(|(id, entry)| {
                let score = if query_norm == 0.0 || entry.norm == 0.0 {
                    0.0
                } else {
                    let dot: f32 = query.iter().zip(entry.vector.iter()).map(|(a, b)| a * b).sum();
                    dot / (query_norm * entry.norm)
                };
                (id.clone(), score)
            })
            .collect();
        drop(inner);

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }
}
