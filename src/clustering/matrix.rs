//! Pairwise cosine distance matrix for one tenant's batch.

use rayon::prelude::*;

use crate::semantic::similarity::{cosine_distance, SimilarityError};

/// Symmetric `N×N` matrix of cosine distances with a zero diagonal.
/// Only the upper triangle is computed; it is mirrored on construction.
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    size: usize,
    distances: Vec<f32>,
}

impl DistanceMatrix {
    /// Compute all pairwise distances. Rows are computed in parallel.
    ///
    /// Fails on the first vector whose length differs from the first one.
    pub fn build(vectors: &[&[f32]]) -> Result<Self, SimilarityError> {
        let size = vectors.len();
        if let Some(first) = vectors.first() {
            let expected = first.len();
            if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
                return Err(SimilarityError::DimensionMismatch {
                    expected,
                    got: bad.len(),
                });
            }
        }

        let upper: Vec<Vec<f32>> = (0..size)
            .into_par_iter()
            .map(|i| {
                ((i + 1)..size)
                    .map(|j| cosine_distance(vectors[i], vectors[j]))
                    .collect::<Result<Vec<f32>, _>>()
            })
            .collect::<Result<_, _>>()?;

        let mut distances = vec![0.0; size * size];
        for (i, row) in upper.iter().enumerate() {
            for (offset, &d) in row.iter().enumerate() {
                let j = i + 1 + offset;
                distances[i * size + j] = d;
                distances[j * size + i] = d;
            }
        }

        Ok(Self { size, distances })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.distances[i * self.size + j]
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.distances[i * self.size..(i + 1) * self.size]
    }

    /// Indices within `epsilon` of `p`, `p` itself included.
    pub fn region_query(&self, p: usize, epsilon: f32) -> Vec<usize> {
        self.row(p)
            .iter()
            .enumerate()
            .filter(|(_, d)| **d <= epsilon)
            .map(|(idx, _)| idx)
            .collect()
    }
}
