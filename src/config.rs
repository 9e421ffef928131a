//! Store configuration.
//!
//! [`StoreConfig`] collects every external knob a store needs —
//! database path, dimension policy, similarity function, dimension
//! adaptation mode, HNSW parameters, quantization scheme, batch size, and
//! the fused-score clamp — behind `Default` impls so a store can be opened
//! with zero configuration. Loaded from YAML via `serde_yaml`.

use std::fs;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dim_adapter::AdaptMode;
use crate::error::{Result, VectorDbError};
use crate::quantize::QuantizationConfig;
use crate::similarity::Similarity;

/// HNSW construction/search knobs exposed at the store boundary. See
/// `hnsw::HnswParams` for the index-internal representation; this struct
/// is the serializable, user-facing mirror of it plus the `enabled` flag
/// that switches the whole index off in favor of brute-force linear scan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HnswConfig {
    /// When `false`, `Search` falls back to a brute-force linear scan over
    /// every live embedding instead of consulting the HNSW graph. Useful
    /// for small stores or as a recall baseline in tests.
    pub enabled: bool,
    /// Max neighbors per node above layer 0 (`M`).
    pub m: usize,
    /// Beam width used while inserting.
    pub ef_construction: usize,
    /// Default beam width used while searching.
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            m: 16,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

/// Controls whether fused hybrid scores are clamped to `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TextSimilarityConfig {
    /// When `true`, disables the `[0, 1]` clamp normally applied to fused
    /// vector+keyword scores (RRF scores are already bounded in practice,
    /// but weighted variants with caller-supplied weights can exceed 1).
    pub allow_score_above_one: bool,
}

/// Full configuration for opening or creating a store.
///
/// # Examples
///
/// ```
/// use embedgraph::config::StoreConfig;
///
/// let cfg = StoreConfig {
///     path: "/tmp/example.db".into(),
///     ..Default::default()
/// };
/// assert_eq!(cfg.dimensions, 0);
/// assert!(cfg.hnsw.enabled);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file location.
    pub path: String,
    /// Canonical vector dimension. `0` means auto-detect: the dimension
    /// is fixed at the first non-zero-length write.
    pub dimensions: usize,
    /// Similarity function the store scores vectors with.
    pub similarity: Similarity,
    /// How to reconcile vectors whose length differs from `dimensions`.
    pub auto_dim_adapt: AdaptMode,
    /// HNSW index parameters.
    pub hnsw: HnswConfig,
    /// Quantization scheme applied to stored vectors.
    pub quantization: QuantizationConfig,
    /// Maximum rows written per commit in a batch upsert.
    pub batch_size: usize,
    /// Fused hybrid score clamping behavior.
    pub text_similarity: TextSimilarityConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            dimensions: 0,
            similarity: Similarity::Cosine,
            auto_dim_adapt: AdaptMode::Smart,
            hnsw: HnswConfig::default(),
            quantization: QuantizationConfig::None,
            batch_size: 500,
            text_similarity: TextSimilarityConfig::default(),
        }
    }
}

/// Load a [`StoreConfig`] from a YAML file, falling back to field
/// defaults for anything the file omits (every field carries `#[serde(default)]`
/// via the struct-level attribute).
///
/// # Errors
/// Returns [`VectorDbError::StorageError`] if the file cannot be read or
/// does not parse as YAML.
pub fn load_store_config(file: &str) -> Result<StoreConfig> {
    let content = fs::read_to_string(file).map_err(|e| {
        VectorDbError::StorageError(format!("reading config {file}: {e}"))
    })?;
    let config: StoreConfig = serde_yaml::from_str(&content)
        .map_err(|e| VectorDbError::StorageError(format!("parsing config {file}: {e}")))?;

    if config.path.trim().is_empty() {
        warn!("store config has an empty `path`; caller must supply one before opening");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_is_sane() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.dimensions, 0);
        assert_eq!(cfg.batch_size, 500);
        assert!(cfg.hnsw.enabled);
        assert_eq!(cfg.similarity, Similarity::Cosine);
    }

    #[test]
    fn loads_partial_yaml_with_defaults_filled_in() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "path: /tmp/test.db\ndimensions: 768\n").unwrap();
        let cfg = load_store_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.path, "/tmp/test.db");
        assert_eq!(cfg.dimensions, 768);
        assert_eq!(cfg.batch_size, 500); // default, not in the YAML
    }

    #[test]
    fn missing_file_errors() {
        assert!(load_store_config("/nonexistent/path.yaml").is_err());
    }

    #[test]
    fn malformed_yaml_errors() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not: [valid: yaml").unwrap();
        assert!(load_store_config(file.path().to_str().unwrap()).is_err());
    }
}
