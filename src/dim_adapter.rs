//! Dimension adaptation: reconciles vectors of differing widths with the
//! store's canonical dimension at ingest and query time.
//!
//! Adaptation is pure and deterministic: the same input vector adapted
//! twice against the same target dimension and mode produces a
//! bytewise-identical result (spec invariant "dim adapt determinism").
//! The `Project` mode derives its projection matrix from a `blake3` hash
//! of `(source_dim, target_dim)` expanded through a seeded PRNG, so the
//! matrix itself never needs to be persisted — only the two dimensions.

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VectorDbError};
use crate::similarity::norm;

/// How to reconcile a vector whose length differs from the store's
/// configured dimension `D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdaptMode {
    /// Any length mismatch is a hard error.
    Strict,
    /// Drop the tail if the source is longer than `D`; error if shorter.
    Truncate,
    /// Zero-extend if the source is shorter than `D`; error if longer.
    Pad,
    /// Deterministic hashed random projection to `D`, preserving
    /// expected dot products (Achlioptas-style ±1/sqrt(D) projection).
    Project,
    /// Truncate if source is longer than `D`, pad if shorter.
    Smart,
}

impl Default for AdaptMode {
    fn default() -> Self {
        AdaptMode::Smart
    }
}

/// Adapt `v` to length `target_dim` under `mode`. Re-normalizes the
/// result whenever the adaptation can change the vector's magnitude
/// (padding dilutes norm over a fixed-size accumulator context;
/// projection changes it directly), so downstream cosine/dot scoring
/// behaves consistently regardless of the original source width.
///
/// # Errors
/// Returns [`VectorDbError::DimensionMismatch`] when the mode forbids
/// the observed mismatch (`Strict` on any mismatch; `Truncate` on a
/// too-short source; `Pad` on a too-long source).
pub fn adapt(v: &[f32], target_dim: usize, mode: AdaptMode) -> Result<Vec<f32>> {
    if v.len() == target_dim {
        return Ok(v.to_vec());
    }

    match mode {
        AdaptMode::Strict => Err(VectorDbError::DimensionMismatch {
            expected: target_dim,
            actual: v.len(),
        }),
        AdaptMode::Truncate => {
            if v.len() < target_dim {
                return Err(VectorDbError::DimensionMismatch {
                    expected: target_dim,
                    actual: v.len(),
                });
            }
            Ok(truncate(v, target_dim))
        }
        AdaptMode::Pad => {
            if v.len() > target_dim {
                return Err(VectorDbError::DimensionMismatch {
                    expected: target_dim,
                    actual: v.len(),
                });
            }
            Ok(pad(v, target_dim))
        }
        AdaptMode::Smart => {
            if v.len() > target_dim {
                Ok(truncate(v, target_dim))
            } else {
                Ok(pad(v, target_dim))
            }
        }
        AdaptMode::Project => Ok(project(v, target_dim)),
    }
}

fn truncate(v: &[f32], target_dim: usize) -> Vec<f32> {
    renormalize(&v[..target_dim], norm(v))
}

fn pad(v: &[f32], target_dim: usize) -> Vec<f32> {
    let mut out = v.to_vec();
    out.resize(target_dim, 0.0);
    out
}

/// Re-scale `out` so its norm matches `original_norm`, preserving the
/// vector's magnitude across an adaptation that otherwise only changes
/// which components survive (e.g. truncation).
fn renormalize(out: &[f32], original_norm: f32) -> Vec<f32> {
    let new_norm = norm(out);
    if new_norm < 1e-12 || original_norm < 1e-12 {
        return out.to_vec();
    }
    let scale = original_norm / new_norm;
    out.iter().map(|x| x * scale).collect()
}

/// Deterministic hashed random projection from `v.len()` to `target_dim`.
///
/// The projection matrix is derived from `blake3(source_dim, target_dim)`
/// and never persisted; any caller re-deriving it from the same two
/// dimensions reconstructs an identical matrix.
fn project(v: &[f32], target_dim: usize) -> Vec<f32> {
    let source_dim = v.len();
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"embedgraph-dim-projection-v1");
    hasher.update(&(source_dim as u64).to_le_bytes());
    hasher.update(&(target_dim as u64).to_le_bytes());
    let seed: [u8; 32] = *hasher.finalize().as_bytes();
    let mut rng = StdRng::from_seed(seed);

    let scale = 1.0 / (target_dim as f32).sqrt();
    let mut out = vec![0.0f32; target_dim];
    for out_val in out.iter_mut() {
        let mut acc = 0.0f32;
        for &component in v {
            // Each entry of the projection matrix is independently
            // drawn as +1/-1 with equal probability (a Rademacher
            // random projection), scaled to preserve expected norm.
            let sign: f32 = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            acc += sign * component;
        }
        *out_val = acc * scale;
    }
    renormalize(&out, norm(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_drops_tail() {
        let v = [1.0, 2.0, 3.0, 4.0];
        let out = adapt(&v, 2, AdaptMode::Truncate).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn pad_zero_extends() {
        let v = [1.0, 2.0];
        let out = adapt(&v, 4, AdaptMode::Pad).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn strict_errors_on_mismatch() {
        assert!(adapt(&[1.0], 2, AdaptMode::Strict).is_err());
    }

    #[test]
    fn smart_pads_when_short_and_truncates_when_long() {
        assert_eq!(adapt(&[1.0], 3, AdaptMode::Smart).unwrap().len(), 3);
        assert_eq!(adapt(&[1.0, 2.0, 3.0], 1, AdaptMode::Smart).unwrap().len(), 1);
    }

    #[test]
    fn project_is_deterministic() {
        let v = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let a = project(&v, 8);
        let b = project(&v, 8);
        assert_eq!(a, b);
    }

    #[test]
    fn project_changes_dimension() {
        let v = vec![1.0; 10];
        assert_eq!(project(&v, 4).len(), 4);
    }

    #[test]
    fn project_preserves_source_norm() {
        let v = vec![3.0, -1.0, 4.0, 1.0, -5.0, 9.0, 2.0];
        let out = project(&v, 16);
        assert!((norm(&out) - norm(&v)).abs() < 1e-4);
    }

    #[test]
    fn no_adaptation_needed_returns_same_values() {
        let v = vec![1.0, 2.0, 3.0];
        assert_eq!(adapt(&v, 3, AdaptMode::Strict).unwrap(), v);
    }
}
