//! Exact nearest-neighbour index over active record embeddings

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::memory::MemoryRecord;

/// Cosine similarity between two vectors.
///
/// Returns 0.0 when either vector has zero norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Scale a vector to unit length; zero vectors stay zero
fn normalized(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// Per-persona vector index.
///
/// Vectors are stored unit-normalised so search is a dot product. The index
/// is derived state: it can always be rebuilt from the active records.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dimensions: usize,
    entries: HashMap<Uuid, Vec<f32>>,
}

impl VectorIndex {
    /// Create an empty index for vectors of the given dimension
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            entries: HashMap::new(),
        }
    }

    /// Build an index from the active records of a store
    pub fn from_records<'a>(
        dimensions: usize,
        records: impl IntoIterator<Item = &'a MemoryRecord>,
    ) -> Result<Self> {
        let mut index = Self::new(dimensions);
        for record in records.into_iter().filter(|r| r.is_active()) {
            index.upsert(record.id, &record.embedding)?;
        }
        Ok(index)
    }

    /// Fail unless the vector has this index's dimension and only finite components
    pub fn check_embedding(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        if let Some(position) = embedding.iter().position(|x| !x.is_finite()) {
            return Err(Error::NonFiniteEmbedding { position });
        }
        Ok(())
    }

    /// Insert or replace the vector for `id`
    pub(crate) fn upsert(&mut self, id: Uuid, embedding: &[f32]) -> Result<()> {
        self.check_embedding(embedding)?;
        self.entries.insert(id, normalized(embedding));
        Ok(())
    }

    /// Remove the vector for `id`; returns whether it was present
    pub(crate) fn remove(&mut self, id: Uuid) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Top-`k` ids by cosine similarity, best first.
    ///
    /// Ties are broken by id so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(Uuid, f32)>> {
        self.check_embedding(query)?;

        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let query = normalized(query);
        let mut scored: Vec<(Uuid, f32)> = self
            .entries
            .iter()
            .map(|(id, v)| (*id, v.iter().zip(query.iter()).map(|(a, b)| a * b).sum()))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(scored)
    }

    /// Number of indexed vectors
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.contains_key(&id)
    }

    /// Indexed ids, in no particular order
    pub fn ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.entries.keys().copied()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}
