//! Vector quantization: scalar (SQ8) and product (PQ) quantizers that
//! shrink stored vectors and accelerate candidate scoring.

pub mod product;
pub mod scalar;

use serde::{Deserialize, Serialize};

/// The quantization scheme a store is configured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuantizationConfig {
    /// Store full-precision `f32` vectors only.
    None,
    /// Scalar (SQ8) quantization.
    Sq8,
    /// Product quantization with `m` subspaces and `k` centroids each.
    Pq {
        /// Number of subspaces.
        m: usize,
        /// Centroids per subspace.
        k: usize,
    },
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        QuantizationConfig::None
    }
}
