//! # embedgraph
//!
//! An embedded vector database: dense embeddings plus textual content,
//! metadata, and document grouping, answering approximate-nearest-neighbor
//! and hybrid (vector + keyword) queries over a durable SQLite-backed store.
//!
//! ## Modules
//! - [`store`] — the public façade: [`store::VectorStore`], upsert/search/
//!   delete, hybrid search, ACL and metadata filtering.
//! - [`hnsw`] — the layered proximity graph behind ANN search.
//! - [`quantize`] — scalar (SQ8) and product quantizers.
//! - [`graph`] — the typed node/edge overlay: traversal, shortest path,
//!   PageRank, community detection, hybrid graph+vector scoring.
//! - [`fuser`] — Reciprocal Rank Fusion across vector and keyword hit lists.
//! - [`dim_adapter`] — reconciles vectors of differing widths.
//! - [`similarity`] — cosine/dot/Euclidean kernels.
//! - [`persistence`] — the transactional adapter over the relational store.
//! - [`config`] — store configuration, loaded from YAML.
//! - [`models`] / [`schema`] — Diesel row types and table definitions.
//! - [`cancellation`] — cancellation handles and deadlines for long-running
//!   operations.
//! - [`error`] — the crate's error taxonomy.

use directories::ProjectDirs;
use std::error::Error;

pub mod cancellation;
pub mod config;
pub mod dim_adapter;
pub mod error;
pub mod fuser;
pub mod graph;
pub mod hnsw;
pub mod models;
pub mod persistence;
pub mod quantize;
pub mod schema;
pub mod similarity;
pub mod store;

pub use error::{Result, VectorDbError};
pub use store::{Document, Embedding, HybridQuery, ScoredHit, SearchOptions, Stats, VectorStore};

/// Return the per-platform data directory used when a caller configures a
/// store path relative to the default location rather than an absolute one.
///
/// Uses [`directories::ProjectDirs`] with the application triple
/// `("com", "embedgraph", "embedgraph")`, so callers get the right place on
/// each OS (e.g. `~/Library/Application Support/com.embedgraph.embedgraph`
/// on macOS). The directory is **not** created by this function; callers
/// that need it should create it with `fs::create_dir_all`.
///
/// # Errors
/// Returns an error if the platform data directory cannot be determined
/// (rare, but possible in heavily sandboxed environments).
pub fn data_dir() -> std::result::Result<std::path::PathBuf, Box<dyn Error>> {
    let proj_dirs = ProjectDirs::from("com", "embedgraph", "embedgraph")
        .ok_or("unable to determine data directory")?;
    Ok(proj_dirs.data_dir().to_path_buf())
}
