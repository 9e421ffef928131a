// @generated manually to mirror the store's on-disk tables (see `persistence.rs`
// for the matching `CREATE TABLE` statements and the `content_fts` virtual
// table, which Diesel's schema DSL cannot express).

diesel::table! {
    meta (id) {
        id -> Integer,
        dimension -> Integer,
        similarity -> Text,
        hnsw_m -> Integer,
        hnsw_ef_construction -> Integer,
        hnsw_ef_search -> Integer,
        schema_version -> Integer,
        quantizer_blob -> Nullable<Binary>,
    }
}

diesel::table! {
    documents (doc_id) {
        doc_id -> Text,
        title -> Nullable<Text>,
        author -> Nullable<Text>,
        metadata_json -> Text,
    }
}

diesel::table! {
    embeddings (id) {
        id -> Text,
        collection -> Nullable<Text>,
        doc_id -> Nullable<Text>,
        content -> Nullable<Text>,
        metadata_json -> Text,
        acl_json -> Text,
        vector -> Binary,
        quantized_code -> Nullable<Binary>,
        tombstoned -> Bool,
    }
}

diesel::table! {
    graph_edges (id_text, layer) {
        id_text -> Text,
        layer -> Integer,
        neighbors_json -> Text,
    }
}

diesel::table! {
    nodes (id) {
        id -> Text,
        node_type -> Text,
        properties_json -> Text,
    }
}

diesel::table! {
    edges (id) {
        id -> Integer,
        from_id -> Text,
        to_id -> Text,
        edge_type -> Text,
        weight -> Double,
    }
}

diesel::joinable!(embeddings -> documents (doc_id));

diesel::allow_tables_to_appear_in_same_query!(
    meta,
    documents,
    embeddings,
    graph_edges,
    nodes,
    edges,
);
