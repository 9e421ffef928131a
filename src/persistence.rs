//! The persistence adapter: a narrow transactional interface over
//! the embedded relational store.
//!
//! Two connections are opened against the same SQLite file, mirroring the
//! model repo's split between `diesel::SqliteConnection` (typed row CRUD)
//! and `rusqlite::Connection` (schema DDL and FTS5, which Diesel has no
//! first-class support for): `begin`/`commit`/`rollback` map onto Diesel's
//! `transaction()` closure API, which rolls the transaction back
//! automatically whenever the closure returns `Err`.

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use rusqlite::Connection as RusqliteConnection;
use rusqlite::params;

use crate::error::{Result, VectorDbError};
use crate::models::{DocumentRow, EdgeRow, EmbeddingRow, GraphEdgeRow, MetaRow, NodeRow};
use crate::schema;

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    id INTEGER PRIMARY KEY NOT NULL,
    dimension INTEGER NOT NULL,
    similarity TEXT NOT NULL,
    hnsw_m INTEGER NOT NULL,
    hnsw_ef_construction INTEGER NOT NULL,
    hnsw_ef_search INTEGER NOT NULL,
    schema_version INTEGER NOT NULL,
    quantizer_blob BLOB
);

CREATE TABLE IF NOT EXISTS documents (
    doc_id TEXT PRIMARY KEY NOT NULL,
    title TEXT,
    author TEXT,
    metadata_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    id TEXT PRIMARY KEY NOT NULL,
    collection TEXT,
    doc_id TEXT,
    content TEXT,
    metadata_json TEXT NOT NULL,
    acl_json TEXT NOT NULL,
    vector BLOB NOT NULL,
    quantized_code BLOB,
    tombstoned BOOLEAN NOT NULL DEFAULT 0,
    FOREIGN KEY (doc_id) REFERENCES documents(doc_id)
);
CREATE INDEX IF NOT EXISTS embeddings_doc_id_idx ON embeddings(doc_id);
CREATE INDEX IF NOT EXISTS embeddings_collection_idx ON embeddings(collection);

CREATE TABLE IF NOT EXISTS graph_edges (
    id_text TEXT NOT NULL,
    layer INTEGER NOT NULL,
    neighbors_json TEXT NOT NULL,
    PRIMARY KEY (id_text, layer)
);

CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY NOT NULL,
    node_type TEXT NOT NULL,
    properties_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    edge_type TEXT NOT NULL,
    weight REAL NOT NULL,
    FOREIGN KEY (from_id) REFERENCES nodes(id),
    FOREIGN KEY (to_id) REFERENCES nodes(id)
);
CREATE INDEX IF NOT EXISTS edges_from_idx ON edges(from_id);
CREATE INDEX IF NOT EXISTS edges_to_idx ON edges(to_id);

CREATE VIRTUAL TABLE IF NOT EXISTS content_fts USING fts5(
    id UNINDEXED,
    content
);
"#;

/// The narrow transactional interface the vector store façade and graph
/// overlay use to reach the durable store. Never exposed outside the
/// crate; `store::VectorStore` and `graph::GraphOverlay` are the public
/// surface.
pub struct PersistenceAdapter {
    path: String,
    diesel_conn: SqliteConnection,
    fts_conn: RusqliteConnection,
}

impl PersistenceAdapter {
    /// Open (creating if absent) the database file at `path`, run the DDL,
    /// and establish both connections.
    pub fn open(path: &str) -> Result<Self> {
        let fts_conn = RusqliteConnection::open(path)?;
        fts_conn.execute_batch(DDL)?;

        let diesel_conn = SqliteConnection::establish(path)?;

        Ok(Self {
            path: path.to_string(),
            diesel_conn,
            fts_conn,
        })
    }

    /// Open an in-process, non-persistent store (tests and scratch
    /// instances). Note: `:memory:` databases in SQLite are
    /// connection-local, so the Diesel and rusqlite handles would see
    /// *different* empty databases; callers that need FTS in tests should
    /// use a `tempfile` path instead.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run `f` inside a transaction. A returned `Err` rolls back every
    /// write `f` made through `conn`; a returned `Ok` commits. This is the
    /// `begin`/`commit`/`rollback` triple, collapsed into
    /// Diesel's closure-based transaction API.
    pub fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut SqliteConnection) -> Result<T>,
    ) -> Result<T> {
        self.diesel_conn.transaction(|conn| f(conn))
    }

    // ---- meta ----------------------------------------------------------

    pub fn get_meta(&mut self) -> Result<Option<MetaRow>> {
        Ok(schema::meta::table
            .filter(schema::meta::id.eq(0))
            .first(&mut self.diesel_conn)
            .optional()?)
    }

    pub fn set_meta(&mut self, row: &MetaRow) -> Result<()> {
        diesel::replace_into(schema::meta::table)
            .values(row)
            .execute(&mut self.diesel_conn)?;
        Ok(())
    }

    // ---- documents -------------------------------------------------------

    pub fn upsert_document(&mut self, row: &DocumentRow) -> Result<()> {
        diesel::replace_into(schema::documents::table)
            .values(row)
            .execute(&mut self.diesel_conn)?;
        Ok(())
    }

    pub fn get_document(&mut self, doc_id: &str) -> Result<Option<DocumentRow>> {
        Ok(schema::documents::table
            .find(doc_id)
            .first(&mut self.diesel_conn)
            .optional()?)
    }

    pub fn list_documents(&mut self) -> Result<Vec<DocumentRow>> {
        Ok(schema::documents::table.load(&mut self.diesel_conn)?)
    }

    pub fn delete_document(&mut self, doc_id: &str) -> Result<usize> {
        Ok(diesel::delete(schema::documents::table.find(doc_id))
            .execute(&mut self.diesel_conn)?)
    }

    // ---- embeddings ------------------------------------------------------

    /// Replace-by-ID write. Also mirrors `content` into the `content_fts`
    /// virtual table over the rusqlite connection so keyword search sees
    /// the row immediately.
    pub fn upsert_embedding(&mut self, row: &EmbeddingRow) -> Result<()> {
        diesel::replace_into(schema::embeddings::table)
            .values(row)
            .execute(&mut self.diesel_conn)?;

        self.fts_conn
            .execute("DELETE FROM content_fts WHERE id = ?1", params![row.id])?;
        if let Some(content) = &row.content {
            self.fts_conn.execute(
                "INSERT INTO content_fts (id, content) VALUES (?1, ?2)",
                params![row.id, content],
            )?;
        }
        Ok(())
    }

    /// Write every row in a single Diesel transaction (all-or-nothing),
    /// then mirror `content` into the FTS index row by row. Used by
    /// `VectorStore::upsert_batch`.
    pub fn upsert_embeddings_batch(&mut self, rows: &[EmbeddingRow]) -> Result<()> {
        self.diesel_conn.transaction(|conn| {
            for row in rows {
                diesel::replace_into(schema::embeddings::table)
                    .values(row)
                    .execute(conn)?;
            }
            Ok::<(), VectorDbError>(())
        })?;

        for row in rows {
            self.fts_conn
                .execute("DELETE FROM content_fts WHERE id = ?1", params![row.id])?;
            if let Some(content) = &row.content {
                self.fts_conn.execute(
                    "INSERT INTO content_fts (id, content) VALUES (?1, ?2)",
                    params![row.id, content],
                )?;
            }
        }
        Ok(())
    }

    pub fn get_embedding(&mut self, id: &str) -> Result<Option<EmbeddingRow>> {
        Ok(schema::embeddings::table
            .find(id)
            .first(&mut self.diesel_conn)
            .optional()?)
    }

    pub fn delete_by_id(&mut self, id: &str) -> Result<usize> {
        let deleted = diesel::delete(schema::embeddings::table.find(id))
            .execute(&mut self.diesel_conn)?;
        self.fts_conn
            .execute("DELETE FROM content_fts WHERE id = ?1", params![id])?;
        Ok(deleted)
    }

    pub fn delete_by_doc_id(&mut self, doc_id: &str) -> Result<usize> {
        let ids: Vec<String> = schema::embeddings::table
            .filter(schema::embeddings::doc_id.eq(doc_id))
            .select(schema::embeddings::id)
            .load(&mut self.diesel_conn)?;

        let deleted = diesel::delete(
            schema::embeddings::table.filter(schema::embeddings::doc_id.eq(doc_id)),
        )
        .execute(&mut self.diesel_conn)?;

        for id in ids {
            self.fts_conn
                .execute("DELETE FROM content_fts WHERE id = ?1", params![id])?;
        }
        Ok(deleted)
    }

    /// Stream (materialize, at this crate's scale) every live and
    /// tombstoned embedding row, for HNSW index rebuild on open.
    pub fn iter_all_embeddings(&mut self) -> Result<Vec<EmbeddingRow>> {
        Ok(schema::embeddings::table.load(&mut self.diesel_conn)?)
    }

    pub fn count_embeddings(&mut self) -> Result<i64> {
        Ok(schema::embeddings::table
            .filter(schema::embeddings::tombstoned.eq(false))
            .count()
            .get_result(&mut self.diesel_conn)?)
    }

    // ---- full text -------------------------------------------------------

    /// Keyword search over `content` via the FTS5 module. Returns `(id,
    /// bm25)` pairs, higher score first (FTS5's native `bm25()` is
    /// "lower is better", so this negates it to match the rest of the
    /// crate's "higher is better" convention).
    pub fn fts_search(&self, terms: &str, limit: usize) -> Result<Vec<(String, f32)>> {
        if terms.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.fts_conn.prepare(
            "SELECT id, bm25(content_fts) FROM content_fts WHERE content_fts MATCH ?1 \
             ORDER BY bm25(content_fts) LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![terms, limit as i64], |row| {
            let id: String = row.get(0)?;
            let raw_bm25: f64 = row.get(1)?;
            Ok((id, -raw_bm25 as f32))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(VectorDbError::from)?);
        }
        Ok(out)
    }

    // ---- graph edges (HNSW persistence) -----------------------------------

    pub fn save_graph_edges(&mut self, id: &str, layer: i32, neighbors_json: &str) -> Result<()> {
        let row = GraphEdgeRow {
            id_text: id.to_string(),
            layer,
            neighbors_json: neighbors_json.to_string(),
        };
        diesel::replace_into(schema::graph_edges::table)
            .values(&row)
            .execute(&mut self.diesel_conn)?;
        Ok(())
    }

    pub fn load_graph_edges(&mut self, id: &str) -> Result<Vec<(i32, String)>> {
        Ok(schema::graph_edges::table
            .filter(schema::graph_edges::id_text.eq(id))
            .select((schema::graph_edges::layer, schema::graph_edges::neighbors_json))
            .load(&mut self.diesel_conn)?)
    }

    pub fn load_all_graph_edges(&mut self) -> Result<Vec<GraphEdgeRow>> {
        Ok(schema::graph_edges::table.load(&mut self.diesel_conn)?)
    }

    // ---- graph overlay (nodes/edges) --------------------------------------

    pub fn upsert_node(&mut self, row: &NodeRow) -> Result<()> {
        diesel::replace_into(schema::nodes::table)
            .values(row)
            .execute(&mut self.diesel_conn)?;
        Ok(())
    }

    pub fn get_node(&mut self, id: &str) -> Result<Option<NodeRow>> {
        Ok(schema::nodes::table
            .find(id)
            .first(&mut self.diesel_conn)
            .optional()?)
    }

    pub fn list_nodes(&mut self) -> Result<Vec<NodeRow>> {
        Ok(schema::nodes::table.load(&mut self.diesel_conn)?)
    }

    /// Delete a node and cascade-delete every edge touching it.
    pub fn delete_node(&mut self, id: &str) -> Result<()> {
        diesel::delete(
            schema::edges::table.filter(
                schema::edges::from_id
                    .eq(id)
                    .or(schema::edges::to_id.eq(id)),
            ),
        )
        .execute(&mut self.diesel_conn)?;
        diesel::delete(schema::nodes::table.find(id)).execute(&mut self.diesel_conn)?;
        Ok(())
    }

    pub fn insert_edge(&mut self, row: &EdgeRow) -> Result<()> {
        diesel::insert_into(schema::edges::table)
            .values(row)
            .execute(&mut self.diesel_conn)?;
        Ok(())
    }

    pub fn list_all_edges(&mut self) -> Result<Vec<EdgeRow>> {
        Ok(schema::edges::table.load(&mut self.diesel_conn)?)
    }

    pub fn list_edges_from(&mut self, from_id: &str) -> Result<Vec<EdgeRow>> {
        Ok(schema::edges::table
            .filter(schema::edges::from_id.eq(from_id))
            .load(&mut self.diesel_conn)?)
    }

    pub fn list_edges_to(&mut self, to_id: &str) -> Result<Vec<EdgeRow>> {
        Ok(schema::edges::table
            .filter(schema::edges::to_id.eq(to_id))
            .load(&mut self.diesel_conn)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn scratch() -> (NamedTempFile, PersistenceAdapter) {
        let file = NamedTempFile::new().unwrap();
        let adapter = PersistenceAdapter::open(file.path().to_str().unwrap()).unwrap();
        (file, adapter)
    }

    fn sample_row(id: &str) -> EmbeddingRow {
        EmbeddingRow {
            id: id.to_string(),
            collection: None,
            doc_id: None,
            content: Some(format!("hello from {id}")),
            metadata_json: "{}".into(),
            acl_json: "[]".into(),
            vector: vec![0u8; 4],
            quantized_code: None,
            tombstoned: false,
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let (_file, mut db) = scratch();
        db.upsert_embedding(&sample_row("a")).unwrap();
        let row = db.get_embedding("a").unwrap().unwrap();
        assert_eq!(row.content.as_deref(), Some("hello from a"));
    }

    #[test]
    fn upsert_replaces_by_id() {
        let (_file, mut db) = scratch();
        db.upsert_embedding(&sample_row("a")).unwrap();
        let mut second = sample_row("a");
        second.content = Some("updated".into());
        db.upsert_embedding(&second).unwrap();

        assert_eq!(db.count_embeddings().unwrap(), 1);
        let row = db.get_embedding("a").unwrap().unwrap();
        assert_eq!(row.content.as_deref(), Some("updated"));
    }

    #[test]
    fn delete_by_id_removes_row_and_fts_entry() {
        let (_file, mut db) = scratch();
        db.upsert_embedding(&sample_row("a")).unwrap();
        db.delete_by_id("a").unwrap();
        assert!(db.get_embedding("a").unwrap().is_none());
        assert!(db.fts_search("hello", 10).unwrap().is_empty());
    }

    #[test]
    fn fts_search_finds_matching_content() {
        let (_file, mut db) = scratch();
        db.upsert_embedding(&sample_row("a")).unwrap();
        db.upsert_embedding(&sample_row("b")).unwrap();
        let hits = db.fts_search("hello", 10).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let (_file, mut db) = scratch();
        let result: Result<()> = db.transaction(|conn| {
            diesel::insert_into(schema::embeddings::table)
                .values(&sample_row("a"))
                .execute(conn)?;
            Err(VectorDbError::StorageError("boom".into()))
        });
        assert!(result.is_err());
        assert!(db.get_embedding("a").unwrap().is_none());
    }

    #[test]
    fn graph_edges_round_trip() {
        let (_file, mut db) = scratch();
        db.save_graph_edges("a", 0, "[\"b\",\"c\"]").unwrap();
        let edges = db.load_graph_edges("a").unwrap();
        assert_eq!(edges, vec![(0, "[\"b\",\"c\"]".to_string())]);
    }

    #[test]
    fn delete_node_cascades_to_edges() {
        let (_file, mut db) = scratch();
        db.upsert_node(&NodeRow {
            id: "a".into(),
            node_type: "doc".into(),
            properties_json: "{}".into(),
        })
        .unwrap();
        db.upsert_node(&NodeRow {
            id: "b".into(),
            node_type: "doc".into(),
            properties_json: "{}".into(),
        })
        .unwrap();
        db.insert_edge(&EdgeRow {
            id: None,
            from_id: "a".into(),
            to_id: "b".into(),
            edge_type: "links_to".into(),
            weight: 1.0,
        })
        .unwrap();

        db.delete_node("a").unwrap();
        assert!(db.get_node("a").unwrap().is_none());
        assert!(db.list_all_edges().unwrap().is_empty());
    }
}
