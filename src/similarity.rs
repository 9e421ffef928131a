//! Similarity kernels over equal-length `f32` vectors.
//!
//! Three kernels are supported: cosine, dot product, and Euclidean
//! (returned as negative distance so "larger is better" ordering is
//! uniform across all three). All kernels accumulate in `f32` and guard
//! against zero norms with a small epsilon.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VectorDbError};

/// Guards against division by a near-zero norm.
const EPS: f32 = 1e-12;

/// The similarity function a store is configured with. Selected at
/// store creation and encoded in the on-disk header; immutable
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Similarity {
    /// `dot(a, b) / (||a|| * ||b||)`, 0 when either norm is ~0.
    Cosine,
    /// Raw dot product.
    Dot,
    /// Negative Euclidean distance (`-||a - b||`).
    Euclidean,
}

impl Similarity {
    /// Whether higher raw kernel output corresponds to "closer" (a
    /// distance) or "better" (a similarity). All three variants here
    /// are scored so that larger is always better, so this is always
    /// `false`.
    pub fn is_distance(self) -> bool {
        false
    }

    /// Score two equal-length vectors under this similarity function.
    ///
    /// # Errors
    /// Returns [`VectorDbError::DimensionMismatch`] if `a.len() != b.len()`.
    /// Callers that might present mismatched lengths should route vectors
    /// through the dimension adapter first.
    pub fn score(self, a: &[f32], b: &[f32]) -> Result<f32> {
        if a.len() != b.len() {
            return Err(VectorDbError::DimensionMismatch {
                expected: a.len(),
                actual: b.len(),
            });
        }
        Ok(match self {
            Similarity::Cosine => cosine(a, b),
            Similarity::Dot => dot(a, b),
            Similarity::Euclidean => -euclidean_distance(a, b),
        })
    }
}

/// Dot product of two equal-length vectors.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// L2 norm of a vector.
#[inline]
pub fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

/// Cosine similarity: `dot(a,b) / (||a|| * ||b||)`. Returns `0.0` if
/// either vector's norm is within [`EPS`] of zero, so degenerate zero
/// vectors never produce `NaN`.
#[inline]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let na = norm(a);
    let nb = norm(b);
    if na < EPS || nb < EPS {
        return 0.0;
    }
    dot(a, b) / (na * nb)
}

/// Euclidean (L2) distance between two equal-length vectors.
#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_nonzero_vectors_is_one() {
        let v = [1.0, 2.0, 3.0];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        let zero = [0.0, 0.0, 0.0];
        let v = [1.0, 2.0, 3.0];
        assert_eq!(cosine(&zero, &v), 0.0);
        assert_eq!(cosine(&zero, &zero), 0.0);
    }

    #[test]
    fn orthogonal_vectors_have_zero_cosine() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn euclidean_similarity_is_negative_distance() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];
        let s = Similarity::Euclidean.score(&a, &b).unwrap();
        assert!((s + 5.0).abs() < 1e-5);
    }

    #[test]
    fn mismatched_lengths_error() {
        let a = [1.0, 2.0];
        let b = [1.0, 2.0, 3.0];
        assert!(Similarity::Cosine.score(&a, &b).is_err());
    }

    #[test]
    fn dot_product_basic() {
        assert_eq!(dot(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
    }
}
