//! Density-based grouping of embedded items.
//!
//! - `matrix`: pairwise cosine distances for one batch
//! - `dbscan`: labelling and cluster summaries
//! - `title`: suggested cluster titles and keywords
//! - `tuner`: silhouette sweep over epsilon candidates

pub mod dbscan;
pub mod matrix;
pub mod title;
pub mod tuner;

use crate::semantic::similarity::SimilarityError;

pub use dbscan::{cluster_items, Cluster, ClusteringOutcome, DbscanParams, Label};
pub use matrix::DistanceMatrix;
pub use tuner::{tune_epsilon, TuningRange, TuningReport};

#[derive(Debug, thiserror::Error)]
pub enum ClusteringError {
    #[error("{0}")]
    Similarity(#[from] SimilarityError),

    #[error("Invalid clustering parameter: {0}")]
    InvalidParameter(String),
}
