//! Cosine similarity primitives.
//!
//! Pure functions shared by the distance matrix, the clustering engine and
//! semantic search. Comparing vectors of different lengths is always an error.

/// Errors raised when vectors cannot be compared.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimilarityError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector is empty")]
    Empty,

    #[error("Vector contains a non-finite value at index {0}")]
    NonFinite(usize),

    #[error("Vector has zero norm")]
    ZeroNorm,
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity in `[-1, 1]`.
///
/// A zero-norm operand has no direction and scores `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }

    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        return Ok(0.0);
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();

    // rounding can push |cos| a hair past 1
    Ok((dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0))
}

/// `1 - cosine_similarity`, in `[0, 2]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    Ok(1.0 - cosine_similarity(a, b)?)
}

/// Check that `v` can take part in similarity computations against vectors of
/// `expected_dim` components.
pub fn validate_vector(v: &[f32], expected_dim: usize) -> Result<(), SimilarityError> {
    if v.is_empty() {
        return Err(SimilarityError::Empty);
    }
    if v.len() != expected_dim {
        return Err(SimilarityError::DimensionMismatch {
            expected: expected_dim,
            got: v.len(),
        });
    }
    if let Some(idx) = v.iter().position(|x| !x.is_finite()) {
        return Err(SimilarityError::NonFinite(idx));
    }
    if l2_norm(v) < f32::EPSILON {
        return Err(SimilarityError::ZeroNorm);
    }
    Ok(())
}

/// Component-wise mean of `vectors`. `None` for an empty input.
pub fn centroid<'a, I>(vectors: I) -> Result<Option<Vec<f32>>, SimilarityError>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum: Option<Vec<f32>> = None;
    let mut count = 0usize;

    for v in vectors {
        match sum.as_mut() {
            None => sum = Some(v.to_vec()),
            Some(acc) => {
                if acc.len() != v.len() {
                    return Err(SimilarityError::DimensionMismatch {
                        expected: acc.len(),
                        got: v.len(),
                    });
                }
                acc.iter_mut().zip(v).for_each(|(a, x)| *a += x);
            }
        }
        count += 1;
    }

    Ok(sum.map(|mut acc| {
        acc.iter_mut().for_each(|a| *a /= count as f32);
        acc
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random_vectors(n: usize, dim: usize) -> Vec<Vec<f32>> {
        // small LCG so the test stays deterministic without extra deps
        let mut state: u32 = 0x2545_f491;
        (0..n)
            .map(|_| {
                (0..dim)
                    .map(|_| {
                        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                        (state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_self_similarity_is_one() {
        for v in pseudo_random_vectors(20, 16) {
            let sim = cosine_similarity(&v, &v).unwrap();
            assert!((sim - 1.0).abs() < 1e-5, "got {sim}");
        }
    }

    #[test]
    fn test_symmetric_and_bounded() {
        let vs = pseudo_random_vectors(12, 8);
        for a in &vs {
            for b in &vs {
                let ab = cosine_similarity(a, b).unwrap();
                let ba = cosine_similarity(b, a).unwrap();
                assert_eq!(ab, ba);
                assert!((-1.0..=1.0).contains(&ab));
            }
        }
    }

    #[test]
    fn test_orthogonal_and_opposite() {
        let x = [1.0, 0.0];
        let y = [0.0, 1.0];
        let neg_x = [-1.0, 0.0];

        assert!(cosine_similarity(&x, &y).unwrap().abs() < 1e-6);
        assert!((cosine_similarity(&x, &neg_x).unwrap() + 1.0).abs() < 1e-6);
        assert!((cosine_distance(&x, &neg_x).unwrap() - 2.0).abs() < 1e-6);
        assert!(cosine_distance(&x, &x).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let result = cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0]);
        assert_eq!(
            result,
            Err(SimilarityError::DimensionMismatch {
                expected: 3,
                got: 2
            })
        );
        assert!(cosine_distance(&[1.0], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_zero_norm_scores_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_validate_vector() {
        assert!(validate_vector(&[0.5, 0.5], 2).is_ok());
        assert_eq!(validate_vector(&[], 2), Err(SimilarityError::Empty));
        assert!(matches!(
            validate_vector(&[1.0], 2),
            Err(SimilarityError::DimensionMismatch { .. })
        ));
        assert_eq!(
            validate_vector(&[1.0, f32::NAN], 2),
            Err(SimilarityError::NonFinite(1))
        );
        assert_eq!(validate_vector(&[0.0, 0.0], 2), Err(SimilarityError::ZeroNorm));
    }

    #[test]
    fn test_centroid() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let c = centroid([a.as_slice(), b.as_slice()]).unwrap().unwrap();
        assert_eq!(c, vec![0.5, 0.5]);

        assert_eq!(centroid(std::iter::empty::<&[f32]>()).unwrap(), None);
        assert!(centroid([a.as_slice(), &[1.0, 2.0, 3.0][..]]).is_err());
    }
}
