//! Epsilon selection by silhouette score.
//!
//! Every candidate is clustered at `min_points = 2` with no cluster cap, over
//! a distance matrix built once for the whole sweep.

use serde::Serialize;

use crate::clustering::dbscan::{group_labels, label_points, DbscanParams, Label};
use crate::clustering::matrix::DistanceMatrix;
use crate::clustering::ClusteringError;
use crate::config::TuningConfig;
use crate::items::Item;

const TUNING_MIN_POINTS: usize = 2;
const RANGE_TOLERANCE: f32 = 1e-4;

/// Inclusive `[min, max]` sweep with a fixed step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningRange {
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

impl TuningRange {
    pub fn new(min: f32, max: f32, step: f32) -> Result<Self, ClusteringError> {
        if !(min > 0.0 && max <= 2.0 && min <= max) {
            return Err(ClusteringError::InvalidParameter(format!(
                "tuning range [{min}, {max}] must lie within (0, 2] with min <= max"
            )));
        }
        if step <= 0.0 || !step.is_finite() {
            return Err(ClusteringError::InvalidParameter(format!(
                "tuning step must be positive, got {step}"
            )));
        }
        Ok(Self { min, max, step })
    }

    pub fn from_config(config: &TuningConfig) -> Result<Self, ClusteringError> {
        Self::new(config.min_epsilon, config.max_epsilon, config.step)
    }

    pub fn candidates(&self) -> Vec<f32> {
        let mut out = Vec::new();
        let mut i = 0u32;
        loop {
            let epsilon = self.min + i as f32 * self.step;
            if epsilon > self.max + RANGE_TOLERANCE {
                break;
            }
            out.push(epsilon.min(2.0));
            i += 1;
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateScore {
    pub epsilon: f32,
    pub score: f32,
    pub clusters: usize,
    pub noise: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TuningReport {
    pub best_epsilon: f32,
    pub best_score: f32,
    pub candidates: Vec<CandidateScore>,
}

impl TuningReport {
    /// The winning epsilon, unless no candidate produced any cluster.
    pub fn accepted_epsilon(&self) -> Option<f32> {
        (self.best_score > -1.0).then_some(self.best_epsilon)
    }
}

/// Sweep `range` over the embedded subset of `items`.
///
/// The first candidate with the strictly highest score wins, so ties go to the
/// smallest epsilon.
pub fn tune_epsilon(items: &[Item], range: &TuningRange) -> Result<TuningReport, ClusteringError> {
    let vectors: Vec<&[f32]> = items.iter().filter_map(|i| i.embedding.as_deref()).collect();
    let matrix = DistanceMatrix::build(&vectors)?;

    let mut candidates = Vec::new();
    let mut best: Option<(f32, f32)> = None;

    for epsilon in range.candidates() {
        let params = DbscanParams::new(epsilon, TUNING_MIN_POINTS, usize::MAX)?;
        let labels = label_points(&matrix, &params);
        let score = silhouette_score(&matrix, &labels);

        candidates.push(CandidateScore {
            epsilon,
            score,
            clusters: group_labels(&labels).len(),
            noise: labels.iter().filter(|l| !matches!(l, Label::Cluster(_))).count(),
        });

        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((epsilon, score));
        }
    }

    let (best_epsilon, best_score) = best.unwrap_or((range.min, -1.0));
    log::debug!(
        "epsilon sweep over {} items: best {best_epsilon:.3} (score {best_score:.4})",
        vectors.len()
    );

    Ok(TuningReport {
        best_epsilon,
        best_score,
        candidates,
    })
}

/// Mean silhouette over all non-noise points, `-1` when there are none.
///
/// For a point, `a` is the mean distance to the rest of its own cluster and
/// `b` the smallest mean distance to any other cluster. With a single cluster
/// there is no `b` and every point scores 0, as does a singleton member.
pub fn silhouette_score(matrix: &DistanceMatrix, labels: &[Label]) -> f32 {
    let groups = group_labels(labels);
    if groups.is_empty() {
        return -1.0;
    }

    let mut total = 0.0f32;
    let mut points = 0usize;

    for (gid, members) in &groups {
        for &p in members {
            points += 1;
            if members.len() < 2 {
                continue;
            }

            let a = mean_distance(matrix, p, members);
            let b = groups
                .iter()
                .filter(|(other, _)| other != gid)
                .map(|(_, others)| mean_distance(matrix, p, others))
                .fold(f32::INFINITY, f32::min);

            if !b.is_finite() {
                continue;
            }
            let denom = a.max(b);
            if denom > 0.0 {
                total += (b - a) / denom;
            }
        }
    }

    total / points as f32
}

/// Mean distance from `p` to every other index in `members`.
fn mean_distance(matrix: &DistanceMatrix, p: usize, members: &[usize]) -> f32 {
    let (sum, count) = members
        .iter()
        .filter(|&&q| q != p)
        .fold((0.0f32, 0usize), |(sum, count), &q| (sum + matrix.get(p, q), count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}
