//! Diesel row models for the store's tables.
//!
//! Each model is a thin typed view over a `schema.rs` table. Higher-level
//! domain types (`Embedding`, `Document`, graph `Node`/`Edge`) live in
//! `store.rs` and `graph/mod.rs`; the persistence adapter converts between
//! them and these rows, keeping JSON-shaped columns (`metadata_json`,
//! `acl_json`, `properties_json`, `neighbors_json`) as plain `String` here
//! so this module stays free of the encode/decode logic.

use diesel::prelude::*;

/// The store header: canonical dimension, similarity function, and HNSW
/// parameters. There is exactly one row (`id = 0`); an open on a file with
/// a mismatched `schema_version` is `Corrupted` and requires a rebuild.
#[derive(Queryable, Insertable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::meta)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MetaRow {
    pub id: i32,
    pub dimension: i32,
    pub similarity: String,
    pub hnsw_m: i32,
    pub hnsw_ef_construction: i32,
    pub hnsw_ef_search: i32,
    pub schema_version: i32,
    /// Serialized `ProductQuantizer` (codebooks, M, K, D, trained-flag),
    /// written as a single BLOB per the quantizer's own encoding. `None`
    /// until a PQ quantizer has been trained.
    pub quantizer_blob: Option<Vec<u8>>,
}

/// A document row: the higher-level record a group of embeddings may
/// belong to. Deleting a document cascades to its embeddings.
#[derive(Queryable, Identifiable, Insertable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::documents)]
#[diesel(primary_key(doc_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DocumentRow {
    pub doc_id: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub metadata_json: String,
}

/// An embedding row: the durable truth backing both the HNSW index and
/// search-result hydration. `vector` is the bincode-encoded `Vec<f32>` at
/// the store's canonical dimension; `quantized_code` is present only when
/// the store is configured with SQ8 or PQ quantization.
#[derive(Queryable, Identifiable, Insertable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::embeddings)]
#[diesel(primary_key(id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EmbeddingRow {
    pub id: String,
    pub collection: Option<String>,
    pub doc_id: Option<String>,
    pub content: Option<String>,
    pub metadata_json: String,
    pub acl_json: String,
    pub vector: Vec<u8>,
    pub quantized_code: Option<Vec<u8>>,
    pub tombstoned: bool,
}

/// Persisted adjacency list for one node at one HNSW layer.
/// `neighbors_json` is a JSON array of the neighbors' string IDs.
#[derive(Queryable, Identifiable, Insertable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::graph_edges)]
#[diesel(primary_key(id_text, layer))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct GraphEdgeRow {
    pub id_text: String,
    pub layer: i32,
    pub neighbors_json: String,
}

/// A graph-overlay node: an embedding extended with a type tag and
/// free-form JSON properties.
#[derive(Queryable, Identifiable, Insertable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::nodes)]
#[diesel(primary_key(id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NodeRow {
    pub id: String,
    pub node_type: String,
    pub properties_json: String,
}

/// A graph-overlay edge: `(from, to, type, weight)`. Cascade-deleted when
/// either endpoint's node is removed.
#[derive(Queryable, Identifiable, Insertable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::edges)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EdgeRow {
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    pub from_id: String,
    pub to_id: String,
    pub edge_type: String,
    pub weight: f64,
}
