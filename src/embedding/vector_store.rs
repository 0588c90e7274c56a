//! Vector Index Abstraction
//!
//! One index holds the vectors of one table, keyed by row id. The
//! executor only ever sees the `VectorIndex` trait, so the brute-force
//! `FlatIndex` can be replaced by an approximate structure.

use crate::catalog::RowId;
use crate::error::{NlqError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub row_id: RowId,
    /// Cosine distance, `1 - cos`, in `[0, 2]`
    pub distance: f32,
}

pub trait VectorIndex: Send + Sync {
    /// Dimension fixed by the first vector inserted.
    fn dimension(&self) -> Option<usize>;

    fn upsert(&mut self, row_id: RowId, vector: Embedding) -> Result<()>;

    fn remove(&mut self, row_id: RowId) -> bool;

    /// Up to `k` nearest rows, ascending by distance.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored vectors, ordered by row id.
    fn entries(&self) -> Vec<(RowId, Embedding)>;
}

/// Compute cosine similarity between two embeddings
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a > 0.0 && norm_b > 0.0 {
        dot_product / (norm_a * norm_b)
    } else {
        0.0
    }
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Exact nearest-neighbour search over every stored vector.
#[derive(Debug, Clone, Default)]
pub struct FlatIndex {
    dimension: Option<usize>,
    vectors: BTreeMap<RowId, Embedding>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_dimension(&self, len: usize) -> Result<()> {
        match self.dimension {
            Some(dim) if dim != len => Err(NlqError::Embedding(format!(
                "Embedding dimension {} doesn't match index dimension {}",
                len, dim
            ))),
            _ => Ok(()),
        }
    }
}

impl VectorIndex for FlatIndex {
    fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    fn upsert(&mut self, row_id: RowId, vector: Embedding) -> Result<()> {
        if vector.is_empty() {
            return Err(NlqError::Embedding("cannot index an empty vector".to_string()));
        }
        self.check_dimension(vector.len())?;
        self.dimension = Some(vector.len());
        self.vectors.insert(row_id, vector);
        Ok(())
    }

    fn remove(&mut self, row_id: RowId) -> bool {
        self.vectors.remove(&row_id).is_some()
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if self.vectors.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        self.check_dimension(query.len())?;

        let mut results: Vec<Neighbor> = self
            .vectors
            .iter()
            .map(|(row_id, vector)| Neighbor {
                row_id: *row_id,
                distance: cosine_distance(query, vector),
            })
            .collect();

        // Ties broken by row id so repeated searches agree
        results.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.row_id.cmp(&b.row_id))
        });
        results.truncate(k);
        Ok(results)
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn entries(&self) -> Vec<(RowId, Embedding)> {
        self.vectors
            .iter()
            .map(|(id, v)| (*id, v.clone()))
            .collect()
    }
}
