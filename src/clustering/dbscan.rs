//! DBSCAN over cosine distance.
//!
//! Density-based rather than centroid-based: the number of topics is not known
//! up front, and one-off items must end up as noise instead of being pulled
//! into the nearest group.

use std::collections::VecDeque;

use crate::clustering::matrix::DistanceMatrix;
use crate::clustering::title::suggest_title;
use crate::clustering::ClusteringError;
use crate::config::ClusteringConfig;
use crate::eid::ItemId;
use crate::items::Item;
use crate::semantic::similarity::centroid;

/// Per-point outcome of a DBSCAN run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Unvisited,
    Noise,
    Cluster(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DbscanParams {
    pub epsilon: f32,
    pub min_points: usize,
    pub max_clusters: usize,
}

impl DbscanParams {
    pub fn new(epsilon: f32, min_points: usize, max_clusters: usize) -> Result<Self, ClusteringError> {
        if !(epsilon > 0.0 && epsilon <= 2.0) {
            return Err(ClusteringError::InvalidParameter(format!(
                "epsilon must be in (0, 2], got {epsilon}"
            )));
        }
        if min_points == 0 {
            return Err(ClusteringError::InvalidParameter(
                "min_points must be at least 1".to_string(),
            ));
        }
        if max_clusters == 0 {
            return Err(ClusteringError::InvalidParameter(
                "max_clusters must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            epsilon,
            min_points,
            max_clusters,
        })
    }

    pub fn from_config(config: &ClusteringConfig) -> Result<Self, ClusteringError> {
        Self::new(config.epsilon, config.min_points, config.max_clusters)
    }

    pub fn with_epsilon(self, epsilon: f32) -> Result<Self, ClusteringError> {
        Self::new(epsilon, self.min_points, self.max_clusters)
    }
}

/// Label every point of `matrix`, breaking border ties by point index.
pub fn label_points(matrix: &DistanceMatrix, params: &DbscanParams) -> Vec<Label> {
    label_points_by(matrix, params, |p| p)
}

/// Label every point of `matrix`.
///
/// Points are visited in index order. A point whose epsilon-neighbourhood
/// (itself included) has fewer than `min_points` members is noise until some
/// cluster reaches it as a border point. Once `max_clusters` clusters exist,
/// every point that is still unvisited stays noise.
///
/// A border point within reach of several clusters ends up with the cluster
/// of its nearest core point, ties going to the core point with the smallest
/// `tie_key`. With a key that does not depend on position (item ids), the
/// resulting partition is the same for any input order.
pub fn label_points_by<K, F>(
    matrix: &DistanceMatrix,
    params: &DbscanParams,
    tie_key: F,
) -> Vec<Label>
where
    K: Ord,
    F: Fn(usize) -> K,
{
    let mut labels = expand_clusters(matrix, params);
    settle_border_points(matrix, params, &mut labels, tie_key);
    labels
}

fn expand_clusters(matrix: &DistanceMatrix, params: &DbscanParams) -> Vec<Label> {
    if matrix.is_empty() {
        return Vec::new();
    }

    let n = matrix.len();
    let mut labels = vec![Label::Unvisited; n];
    let mut expanded = vec![false; n];
    let mut next_cluster = 0usize;

    for p in 0..n {
        if labels[p] != Label::Unvisited {
            continue;
        }
        if next_cluster >= params.max_clusters {
            labels[p] = Label::Noise;
            continue;
        }

        expanded[p] = true;
        let neighbors = matrix.region_query(p, params.epsilon);
        if neighbors.len() < params.min_points {
            labels[p] = Label::Noise;
            continue;
        }

        let cluster_id = next_cluster;
        next_cluster += 1;
        labels[p] = Label::Cluster(cluster_id);

        let mut queue = VecDeque::new();
        claim(&neighbors, cluster_id, &mut labels, &mut queue);

        while let Some(q) = queue.pop_front() {
            if expanded[q] {
                continue;
            }
            expanded[q] = true;

            let q_neighbors = matrix.region_query(q, params.epsilon);
            if q_neighbors.len() >= params.min_points {
                claim(&q_neighbors, cluster_id, &mut labels, &mut queue);
            }
        }
    }

    labels
}

/// Pull `points` into `cluster_id`. Unvisited points are queued for
/// expansion, noise becomes a border point, members of a cluster stay put.
fn claim(points: &[usize], cluster_id: usize, labels: &mut [Label], queue: &mut VecDeque<usize>) {
    for &q in points {
        match labels[q] {
            Label::Unvisited => {
                labels[q] = Label::Cluster(cluster_id);
                queue.push_back(q);
            }
            Label::Noise => labels[q] = Label::Cluster(cluster_id),
            Label::Cluster(_) => {}
        }
    }
}

/// Hand every clustered non-core point to the cluster of its nearest core
/// neighbour. Core points never move, so their clusters stay as expanded.
fn settle_border_points<K, F>(
    matrix: &DistanceMatrix,
    params: &DbscanParams,
    labels: &mut [Label],
    tie_key: F,
) where
    K: Ord,
    F: Fn(usize) -> K,
{
    let neighborhoods: Vec<Vec<usize>> = (0..matrix.len())
        .map(|p| matrix.region_query(p, params.epsilon))
        .collect();
    let is_core = |p: usize| neighborhoods[p].len() >= params.min_points;

    for p in 0..labels.len() {
        if is_core(p) || !matches!(labels[p], Label::Cluster(_)) {
            continue;
        }

        let owner = neighborhoods[p]
            .iter()
            .copied()
            .filter(|&c| c != p && is_core(c) && matches!(labels[c], Label::Cluster(_)))
            .min_by(|&a, &b| {
                matrix
                    .get(p, a)
                    .total_cmp(&matrix.get(p, b))
                    .then_with(|| tie_key(a).cmp(&tie_key(b)))
            });

        if let Some(c) = owner {
            labels[p] = labels[c];
        }
    }
}

/// Group point indices by cluster id, in order of first appearance.
pub fn group_labels(labels: &[Label]) -> Vec<(usize, Vec<usize>)> {
    let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
    for (idx, label) in labels.iter().enumerate() {
        if let Label::Cluster(id) = label {
            match groups.iter_mut().find(|(gid, _)| gid == id) {
                Some((_, members)) => members.push(idx),
                None => groups.push((*id, vec![idx])),
            }
        }
    }
    groups
}

/// A group of mutually close items found in one run for one tenant.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: usize,
    pub members: Vec<Item>,
    /// Component-wise mean of member embeddings
    pub centroid: Vec<f32>,
    /// Mean cosine similarity over all member pairs
    pub average_similarity: f32,
    pub title: String,
    pub keywords: Vec<String>,
}

impl Cluster {
    pub fn member_ids(&self) -> Vec<ItemId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    /// Distinct non-empty source types, in member order.
    pub fn source_types(&self) -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for member in &self.members {
            let st = member.source_type.trim();
            if !st.is_empty() && !types.iter().any(|t| t == st) {
                types.push(st.to_string());
            }
        }
        types
    }
}

/// Result of clustering one batch.
#[derive(Debug, Clone)]
pub struct ClusteringOutcome {
    /// Best clusters first, at most `max_clusters`
    pub clusters: Vec<Cluster>,
    pub noise: Vec<ItemId>,
    /// Items that were skipped for lack of an embedding
    pub skipped: Vec<ItemId>,
}

/// Run DBSCAN over the embedded subset of `items`.
pub fn cluster_items(items: &[Item], params: &DbscanParams) -> Result<ClusteringOutcome, ClusteringError> {
    let (embedded, skipped): (Vec<&Item>, Vec<&Item>) = items.iter().partition(|i| i.has_embedding());

    let vectors: Vec<&[f32]> = embedded
        .iter()
        .filter_map(|i| i.embedding.as_deref())
        .collect();
    let matrix = DistanceMatrix::build(&vectors)?;
    let ids: Vec<&ItemId> = embedded.iter().map(|i| &i.id).collect();
    let labels = label_points_by(&matrix, params, |p| ids[p]);

    let noise = labels
        .iter()
        .zip(&embedded)
        .filter(|(label, _)| !matches!(label, Label::Cluster(_)))
        .map(|(_, item)| item.id.clone())
        .collect();

    let clusters = build_clusters(&embedded, &matrix, &labels, params)?;

    Ok(ClusteringOutcome {
        clusters,
        noise,
        skipped: skipped.into_iter().map(|i| i.id.clone()).collect(),
    })
}

/// Summarise labelled points into clusters, dropping any group smaller than
/// `min_points`, sorted by descending average similarity.
pub fn build_clusters(
    items: &[&Item],
    matrix: &DistanceMatrix,
    labels: &[Label],
    params: &DbscanParams,
) -> Result<Vec<Cluster>, ClusteringError> {
    let mut clusters = Vec::new();

    for (id, indices) in group_labels(labels) {
        if indices.len() < params.min_points {
            continue;
        }

        let members: Vec<Item> = indices.iter().map(|&i| items[i].clone()).collect();
        let centroid = centroid(members.iter().filter_map(|m| m.embedding.as_deref()))?
            .unwrap_or_default();
        let average_similarity = average_pairwise_similarity(matrix, &indices);
        let (title, keywords) = suggest_title(&members);

        clusters.push(Cluster {
            id,
            members,
            centroid,
            average_similarity,
            title,
            keywords,
        });
    }

    clusters.sort_by(|a, b| {
        b.average_similarity
            .partial_cmp(&a.average_similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    clusters.truncate(params.max_clusters);

    Ok(clusters)
}

/// Mean of `1 - distance` over all `C(n, 2)` pairs. A singleton scores 1.
fn average_pairwise_similarity(matrix: &DistanceMatrix, indices: &[usize]) -> f32 {
    let mut total = 0.0f32;
    let mut pairs = 0usize;
    for (pos, &i) in indices.iter().enumerate() {
        for &j in &indices[pos + 1..] {
            total += 1.0 - matrix.get(i, j);
            pairs += 1;
        }
    }
    if pairs == 0 {
        1.0
    } else {
        total / pairs as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(vectors: &[Vec<f32>]) -> DistanceMatrix {
        let refs: Vec<&[f32]> = vectors.iter().map(|v| v.as_slice()).collect();
        DistanceMatrix::build(&refs).unwrap()
    }

    #[test]
    fn test_params_validation() {
        assert!(DbscanParams::new(0.0, 2, 10).is_err());
        assert!(DbscanParams::new(2.1, 2, 10).is_err());
        assert!(DbscanParams::new(0.15, 0, 10).is_err());
        assert!(DbscanParams::new(0.15, 2, 0).is_err());
        assert!(DbscanParams::new(2.0, 1, 1).is_ok());
    }

    #[test]
    fn test_isolated_points_are_noise() {
        let m = matrix(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![-1.0, 0.0]]);
        let labels = label_points(&m, &DbscanParams::new(0.1, 2, 10).unwrap());
        assert!(labels.iter().all(|l| *l == Label::Noise));
    }

    #[test]
    fn test_noise_is_reclaimed_as_border_point() {
        // 0 sees only 1; 1 sees 0 and 2; 2 sees 1. With min_points 3 only 1 is core.
        let angle = |deg: f32| vec![deg.to_radians().cos(), deg.to_radians().sin()];
        let m = matrix(&[angle(0.0), angle(20.0), angle(40.0)]);
        // cos(20°) ≈ 0.9397 → distance ≈ 0.06; cos(40°) ≈ 0.766 → distance ≈ 0.234
        let labels = label_points(&m, &DbscanParams::new(0.1, 3, 10).unwrap());

        assert_eq!(labels, vec![Label::Cluster(0); 3]);
    }

    #[test]
    fn test_chain_expansion_through_core_points() {
        let angle = |deg: f32| vec![deg.to_radians().cos(), deg.to_radians().sin()];
        let m = matrix(&[angle(0.0), angle(10.0), angle(20.0), angle(30.0), angle(120.0)]);
        // neighbours 10° apart: distance ≈ 0.015
        let labels = label_points(&m, &DbscanParams::new(0.02, 2, 10).unwrap());

        assert_eq!(&labels[..4], &[Label::Cluster(0); 4]);
        assert_eq!(labels[4], Label::Noise);
    }

    #[test]
    fn test_max_clusters_caps_new_clusters() {
        let m = matrix(&[
            vec![1.0, 0.0, 0.0],
            vec![1.0, 0.01, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.01, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![0.0, 0.01, 1.0],
        ]);
        let labels = label_points(&m, &DbscanParams::new(0.1, 2, 2).unwrap());

        assert_eq!(labels[0], Label::Cluster(0));
        assert_eq!(labels[2], Label::Cluster(1));
        assert_eq!(labels[4], Label::Noise);
        assert_eq!(labels[5], Label::Noise);
        assert_eq!(group_labels(&labels).len(), 2);
    }

    #[test]
    fn test_shared_border_point_goes_to_nearest_core() {
        let angle = |deg: f32| vec![deg.to_radians().cos(), deg.to_radians().sin()];
        // eps covers 13.5°; the point at 15.8° sees 3° and 29° only, so it is
        // a border point of both groups and is nearer the first one
        let eps = 1.0 - 13.5f32.to_radians().cos();
        let params = DbscanParams::new(eps, 4, 10).unwrap();
        let forward = [0.0, 1.0, 2.0, 3.0, 15.8, 29.0, 30.0, 31.0, 32.0];

        let m = matrix(&forward.iter().map(|&d| angle(d)).collect::<Vec<_>>());
        let labels = label_points(&m, &params);
        assert_eq!(labels[4], labels[0]);
        assert_ne!(labels[4], labels[5]);

        let backward: Vec<Vec<f32>> = forward.iter().rev().map(|&d| angle(d)).collect();
        let labels = label_points(&matrix(&backward), &params);
        // reversed: index 4 is still the border point, index 8 is 0°
        assert_eq!(labels[4], labels[8]);
        assert_ne!(labels[4], labels[0]);
    }

    #[test]
    fn test_empty_matrix_has_no_labels() {
        let m = matrix(&[]);
        assert!(label_points(&m, &DbscanParams::new(0.15, 2, 10).unwrap()).is_empty());
    }

    #[test]
    fn test_group_labels_keeps_first_appearance_order() {
        let labels = vec![
            Label::Cluster(1),
            Label::Noise,
            Label::Cluster(0),
            Label::Cluster(1),
        ];
        assert_eq!(group_labels(&labels), vec![(1, vec![0, 3]), (0, vec![2])]);
    }

    #[test]
    fn test_average_similarity_of_identical_points() {
        let m = matrix(&[vec![1.0, 0.0], vec![2.0, 0.0], vec![3.0, 0.0]]);
        let avg = average_pairwise_similarity(&m, &[0, 1, 2]);
        assert!((avg - 1.0).abs() < 1e-6);
        assert!((average_pairwise_similarity(&m, &[1]) - 1.0).abs() < 1e-6);
    }
}
