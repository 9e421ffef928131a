//! The vector store façade: the public surface over dimension
//! adaptation, quantization, the HNSW index, and the persistence
//! adapter, under the multi-reader/single-writer concurrency model.
//!
//! A single exclusive lock guards the in-memory HNSW graph; writers
//! (`upsert`, `upsert_batch`, `delete`, `compact`) take it, readers
//! (`search` and friends) take a shared lock. The persistence adapter
//! is behind its own mutex since `rusqlite::Connection` and
//! `SqliteConnection` are both `!Sync`; every write runs inside one
//! transaction so a crash mid-batch never leaves a half-written row
//! visible.

use std::collections::{HashMap, HashSet};

use bincode::config::Configuration;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::{info, instrument, warn};

use crate::cancellation::{CancellationToken, Deadline};
use crate::config::StoreConfig;
use crate::dim_adapter;
use crate::error::{Result, VectorDbError};
use crate::fuser::{self, FusedHit, RankedHit};
use crate::hnsw::{HnswIndex, HnswParams, HnswStats};
use crate::models::{DocumentRow, EmbeddingRow, MetaRow};
use crate::persistence::PersistenceAdapter;
use crate::quantize::product::ProductQuantizer;
use crate::quantize::scalar;
use crate::quantize::QuantizationConfig;
use crate::similarity::Similarity;

/// Bumped whenever the on-disk row shapes change in a way old rows
/// can't be read against. A mismatch at `open()` forces a full index
/// rebuild rather than a `Corrupted` error, since every row shape this
/// crate has ever written is still readable.
const SCHEMA_VERSION: i32 = 1;

/// Candidate-expansion multiplier used by `search_with_filter`'s
/// widen-and-retry loop.
const FILTER_EXPANSION_FACTOR: usize = 4;
const FILTER_MIN_CANDIDATES: usize = 64;
const FILTER_EXPANSION_CAP: usize = 8192;

fn bincode_config() -> Configuration {
    bincode::config::standard()
}

fn encode_vector(v: &[f32]) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(v, bincode_config())?)
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    let (v, _) = bincode::serde::decode_from_slice(bytes, bincode_config())?;
    Ok(v)
}

/// A vector plus the payload carried alongside it. The unit of
/// `upsert`.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub id: String,
    pub vector: Vec<f32>,
    pub content: Option<String>,
    pub doc_id: Option<String>,
    pub collection: Option<String>,
    pub metadata: HashMap<String, String>,
    pub acl: HashSet<String>,
}

impl Embedding {
    /// Construct a bare embedding with no payload; fields can be set
    /// afterwards with the builder-style `with_*` methods.
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            vector,
            content: None,
            doc_id: None,
            collection: None,
            metadata: HashMap::new(),
            acl: HashSet::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_doc_id(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}

/// A higher-level document record a group of embeddings may belong to.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub doc_id: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Options shared by every search variant.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    /// Minimum score a hit must clear to be returned.
    pub threshold: Option<f32>,
    /// Restrict candidates to this collection.
    pub collection: Option<String>,
    pub include_tombstoned: bool,
    pub ef_search: Option<usize>,
    pub cancellation: CancellationToken,
    pub deadline: Option<Deadline>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            threshold: None,
            collection: None,
            include_tombstoned: false,
            ef_search: None,
            cancellation: CancellationToken::none(),
            deadline: None,
        }
    }
}

/// A scored search result, ready to hand back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredHit {
    pub id: String,
    pub score: f32,
    pub content: Option<String>,
    pub doc_id: Option<String>,
    pub collection: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Point-in-time store counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub live_embeddings: usize,
    pub tombstoned_embeddings: usize,
    pub documents: usize,
    pub dimensions: usize,
    pub hnsw: HnswStats,
}

/// A hybrid vector + keyword query for `hybrid_search`.
#[derive(Debug, Clone)]
pub struct HybridQuery {
    pub vector: Vec<f32>,
    pub text: String,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub k_rrf: f32,
}

impl HybridQuery {
    pub fn new(vector: Vec<f32>, text: impl Into<String>) -> Self {
        Self {
            vector,
            text: text.into(),
            vector_weight: 0.5,
            keyword_weight: 0.5,
            k_rrf: fuser::DEFAULT_K_RRF,
        }
    }
}

/// Everything needed to evaluate a metadata predicate against a row
/// without deserializing its full JSON payload ahead of time.
type MetadataFilter<'a> = dyn Fn(&HashMap<String, String>) -> bool + 'a;

struct Row {
    id: String,
    content: Option<String>,
    doc_id: Option<String>,
    collection: Option<String>,
    metadata: HashMap<String, String>,
    acl: HashSet<String>,
}

fn row_to_payload(row: &EmbeddingRow) -> Result<Row> {
    let metadata: HashMap<String, String> = serde_json::from_str(&row.metadata_json)
        .map_err(|e| VectorDbError::Corrupted(format!("metadata_json for {}: {e}", row.id)))?;
    let acl: HashSet<String> = serde_json::from_str(&row.acl_json)
        .map_err(|e| VectorDbError::Corrupted(format!("acl_json for {}: {e}", row.id)))?;
    Ok(Row {
        id: row.id.clone(),
        content: row.content.clone(),
        doc_id: row.doc_id.clone(),
        collection: row.collection.clone(),
        metadata,
        acl,
    })
}

/// The embedded vector database: HNSW ANN search, SQ8/PQ quantization,
/// hybrid vector/keyword retrieval, dimension adaptation, all backed by
/// a relational store on disk.
pub struct VectorStore {
    config: StoreConfig,
    dimension: RwLock<usize>,
    persistence: Mutex<PersistenceAdapter>,
    index: RwLock<HnswIndex>,
    quantizer: RwLock<Option<ProductQuantizer>>,
}

impl VectorStore {
    /// Open (creating if absent) the store at `config.path`, rebuilding
    /// the in-memory HNSW graph from durable rows.
    #[instrument(skip(config), fields(path = %config.path))]
    pub fn open(config: StoreConfig) -> Result<Self> {
        let mut persistence = PersistenceAdapter::open(&config.path)?;
        let hnsw_params = HnswParams {
            m: config.hnsw.m,
            m0: 2 * config.hnsw.m,
            ef_construction: config.hnsw.ef_construction,
            ef_search: config.hnsw.ef_search,
            ml: 1.0 / (config.hnsw.m as f64).ln(),
        };

        let (dimension, quantizer) = match persistence.get_meta()? {
            Some(meta) => {
                if meta.schema_version != SCHEMA_VERSION {
                    warn!(
                        found = meta.schema_version,
                        expected = SCHEMA_VERSION,
                        "schema version mismatch, rebuilding index from durable rows"
                    );
                }
                let quantizer = match &meta.quantizer_blob {
                    Some(bytes) => Some(
                        bincode::serde::decode_from_slice::<ProductQuantizer, _>(
                            bytes,
                            bincode_config(),
                        )
                        .map_err(VectorDbError::from)?
                        .0,
                    ),
                    None => None,
                };
                (meta.dimension as usize, quantizer)
            }
            None => {
                let meta = MetaRow {
                    id: 0,
                    dimension: config.dimensions as i32,
                    similarity: similarity_tag(config.similarity).to_string(),
                    hnsw_m: config.hnsw.m as i32,
                    hnsw_ef_construction: config.hnsw.ef_construction as i32,
                    hnsw_ef_search: config.hnsw.ef_search as i32,
                    schema_version: SCHEMA_VERSION,
                    quantizer_blob: None,
                };
                persistence.set_meta(&meta)?;
                (config.dimensions, None)
            }
        };

        let index = reload_index(&mut persistence, config.similarity, hnsw_params, dimension)?;

        info!(
            live = index.stats().live_nodes,
            tombstoned = index.stats().tombstoned_nodes,
            "opened store"
        );

        Ok(Self {
            config,
            dimension: RwLock::new(dimension),
            persistence: Mutex::new(persistence),
            index: RwLock::new(index),
            quantizer: RwLock::new(quantizer),
        })
    }

    /// Open an in-process scratch store; used by tests.
    pub fn open_ephemeral(config: StoreConfig) -> Result<Self> {
        Self::open(config)
    }

    /// The store's configured similarity kernel, for callers composing
    /// their own scoring (the graph overlay's hybrid search).
    pub fn similarity(&self) -> Similarity {
        self.config.similarity
    }

    /// Direct access to the persistence adapter for the graph overlay,
    /// which manages its own tables (`nodes`, `edges`) behind the same
    /// single-writer mutex as the embedding rows.
    pub(crate) fn persistence_lock(&self) -> parking_lot::MutexGuard<'_, PersistenceAdapter> {
        self.persistence.lock()
    }

    /// Decode the canonical-dimension vector backing a live embedding,
    /// for the graph overlay's vector-similarity scoring. Returns
    /// `None` if `id` doesn't exist or is tombstoned.
    pub(crate) fn get_vector(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let mut persistence = self.persistence.lock();
        match persistence.get_embedding(id)? {
            Some(row) if !row.tombstoned => Ok(Some(decode_vector(&row.vector)?)),
            _ => Ok(None),
        }
    }

    fn hnsw_params(&self) -> HnswParams {
        HnswParams {
            m: self.config.hnsw.m,
            m0: 2 * self.config.hnsw.m,
            ef_construction: self.config.hnsw.ef_construction,
            ef_search: self.config.hnsw.ef_search,
            ml: 1.0 / (self.config.hnsw.m as f64).ln(),
        }
    }

    /// Resolve the canonical dimension for a write: if the store was
    /// opened with `dimensions = 0`, the first non-empty vector fixes
    /// it permanently (persisted to the `meta` row).
    fn resolve_dimension(&self, incoming_len: usize) -> Result<usize> {
        {
            let dim = self.dimension.read();
            if *dim != 0 {
                return Ok(*dim);
            }
        }
        if incoming_len == 0 {
            return Err(VectorDbError::InvalidArgument(
                "cannot auto-detect dimension from an empty vector".into(),
            ));
        }
        let mut dim = self.dimension.write();
        if *dim == 0 {
            *dim = incoming_len;
            let mut persistence = self.persistence.lock();
            if let Some(mut meta) = persistence.get_meta()? {
                meta.dimension = incoming_len as i32;
                persistence.set_meta(&meta)?;
            }
        }
        Ok(*dim)
    }

    fn quantize(&self, vector: &[f32]) -> Result<Option<Vec<u8>>> {
        match &self.config.quantization {
            QuantizationConfig::None => Ok(None),
            QuantizationConfig::Sq8 => {
                let code = scalar::encode(vector)?;
                Ok(Some(bincode::serde::encode_to_vec(&code, bincode_config())?))
            }
            QuantizationConfig::Pq { .. } => {
                let guard = self.quantizer.read();
                match guard.as_ref() {
                    Some(pq) if pq.is_trained() => Ok(Some(pq.encode(vector)?)),
                    _ => Ok(None), // not trained yet; row keeps only the raw vector
                }
            }
        }
    }

    /// Train the PQ quantizer (a no-op unless `quantization` is `Pq`)
    /// on `training_vectors`, persisting the trained codebooks to the
    /// `meta` row.
    ///
    /// # Errors
    /// [`VectorDbError::InvalidArgument`] if `quantization` is not
    /// `Pq`; propagates [`ProductQuantizer::train`] errors otherwise.
    pub fn train_quantizer(&self, training_vectors: &[Vec<f32>], seed: u64) -> Result<()> {
        let QuantizationConfig::Pq { m, k } = self.config.quantization else {
            return Err(VectorDbError::InvalidArgument(
                "store is not configured for PQ quantization".into(),
            ));
        };
        let dim = *self.dimension.read();
        let mut pq = ProductQuantizer::new(dim, m, k)?;
        pq.train(training_vectors, seed)?;

        let blob = bincode::serde::encode_to_vec(&pq, bincode_config())?;
        {
            let mut persistence = self.persistence.lock();
            if let Some(mut meta) = persistence.get_meta()? {
                meta.quantizer_blob = Some(blob);
                persistence.set_meta(&meta)?;
            }
        }
        *self.quantizer.write() = Some(pq);
        Ok(())
    }

    fn to_row(&self, emb: &Embedding, vector: &[f32], quantized_code: Option<Vec<u8>>) -> Result<EmbeddingRow> {
        Ok(EmbeddingRow {
            id: emb.id.clone(),
            collection: emb.collection.clone(),
            doc_id: emb.doc_id.clone(),
            content: emb.content.clone(),
            metadata_json: serde_json::to_string(&emb.metadata)
                .map_err(|e| VectorDbError::InvalidArgument(format!("metadata: {e}")))?,
            acl_json: serde_json::to_string(&emb.acl)
                .map_err(|e| VectorDbError::InvalidArgument(format!("acl: {e}")))?,
            vector: encode_vector(vector)?,
            quantized_code,
            tombstoned: false,
        })
    }

    /// Persist the adjacency lists HNSW assigned `id` across every
    /// layer it participates in.
    fn persist_edges(&self, persistence: &mut PersistenceAdapter, index: &HnswIndex, id: &str) -> Result<()> {
        let handle = index
            .handle_of(id)
            .ok_or_else(|| VectorDbError::NotFound(id.to_string()))?;
        for (layer, neighbors) in index.neighbors_for_persistence(handle).iter().enumerate() {
            let neighbor_ids: Vec<&str> = neighbors.iter().map(|h| index.id_of(*h)).collect();
            let json = serde_json::to_string(&neighbor_ids)
                .map_err(|e| VectorDbError::StorageError(format!("encoding edges: {e}")))?;
            persistence.save_graph_edges(id, layer as i32, &json)?;
        }
        Ok(())
    }

    /// Insert or replace-by-ID a single embedding.
    pub fn upsert(&self, emb: Embedding) -> Result<()> {
        self.upsert_checked(emb, CancellationToken::none(), None)
    }

    pub fn upsert_checked(
        &self,
        emb: Embedding,
        cancellation: CancellationToken,
        deadline: Option<Deadline>,
    ) -> Result<()> {
        cancellation.check()?;
        if let Some(d) = &deadline {
            d.check()?;
        }
        let dim = self.resolve_dimension(emb.vector.len())?;
        let vector = dim_adapter::adapt(&emb.vector, dim, self.config.auto_dim_adapt)?;
        let quantized_code = self.quantize(&vector)?;
        let row = self.to_row(&emb, &vector, quantized_code)?;

        let mut index = self.index.write();
        let mut persistence = self.persistence.lock();
        persistence.upsert_embedding(&row)?;
        index.insert(emb.id.clone(), vector)?;
        self.persist_edges(&mut persistence, &index, &emb.id)?;
        Ok(())
    }

    /// Insert or replace a batch of embeddings as a single transaction:
    /// all rows commit together or none do. Vectors are adapted and
    /// quantized before any row is written. Cancellation is checked
    /// between `batch_size`-sized chunks.
    #[instrument(skip(self, embeddings), fields(count = embeddings.len()))]
    pub fn upsert_batch(&self, embeddings: Vec<Embedding>) -> Result<()> {
        self.upsert_batch_checked(embeddings, CancellationToken::none(), None)
    }

    pub fn upsert_batch_checked(
        &self,
        embeddings: Vec<Embedding>,
        cancellation: CancellationToken,
        deadline: Option<Deadline>,
    ) -> Result<()> {
        let mut index = self.index.write();

        for chunk in embeddings.chunks(self.config.batch_size.max(1)) {
            cancellation.check()?;
            if let Some(d) = &deadline {
                d.check()?;
            }

            // Dimension resolution and quantization each take their own
            // short-lived locks, so neither runs while `persistence` is
            // held below.
            let mut rows = Vec::with_capacity(chunk.len());
            for emb in chunk {
                let dim = self.resolve_dimension(emb.vector.len())?;
                let vector = dim_adapter::adapt(&emb.vector, dim, self.config.auto_dim_adapt)?;
                let quantized_code = self.quantize(&vector)?;
                let row = self.to_row(emb, &vector, quantized_code)?;
                rows.push((emb.id.clone(), vector, row));
            }

            let mut persistence = self.persistence.lock();
            persistence.upsert_embeddings_batch(
                &rows.iter().map(|(_, _, row)| row.clone()).collect::<Vec<_>>(),
            )?;
            for (id, vector, _) in &rows {
                index.insert(id.clone(), vector.clone())?;
                self.persist_edges(&mut persistence, &index, id)?;
            }
        }
        Ok(())
    }

    fn brute_force_candidates(&self, index: &HnswIndex, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let arena_len = index.stats().live_nodes + index.stats().tombstoned_nodes;
        let ids: Vec<String> = (0..arena_len)
            .map(|i| index.id_of(crate::hnsw::layer::NodeHandle(i as u64)).to_string())
            .collect();
        let mut scored: Vec<(String, f32)> = ids
            .into_par_iter()
            .filter_map(|id| {
                let handle = index.handle_of(&id)?;
                let score = self.config.similarity.score(query, index.vector_of(handle)).ok()?;
                Some((id, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }

    fn raw_search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(String, f32)> {
        let index = self.index.read();
        if self.config.hnsw.enabled {
            index
                .search(query, k, ef, false)
                .into_iter()
                .map(|(h, score)| (index.id_of(h).to_string(), score))
                .collect()
        } else {
            self.brute_force_candidates(&index, query, k)
        }
    }

    fn hydrate(&self, id: &str) -> Result<Option<Row>> {
        let mut persistence = self.persistence.lock();
        match persistence.get_embedding(id)? {
            Some(row) if !row.tombstoned => Ok(Some(row_to_payload(&row)?)),
            _ => Ok(None),
        }
    }

    fn to_hit(&self, id: &str, score: f32) -> Result<Option<ScoredHit>> {
        Ok(self.hydrate(id)?.map(|row| ScoredHit {
            id: row.id,
            score,
            content: row.content,
            doc_id: row.doc_id,
            collection: row.collection,
            metadata: row.metadata,
        }))
    }

    /// Nearest-neighbor vector search.
    pub fn search(&self, query: &[f32], opts: &SearchOptions) -> Result<Vec<ScoredHit>> {
        opts.cancellation.check()?;
        if let Some(d) = &opts.deadline {
            d.check()?;
        }
        let dim = *self.dimension.read();
        let query = dim_adapter::adapt(query, dim, self.config.auto_dim_adapt)?;
        let ef = opts.ef_search.unwrap_or(self.config.hnsw.ef_search);
        let raw = self.raw_search(&query, opts.top_k, ef);

        let mut hits = Vec::with_capacity(raw.len());
        for (id, score) in raw {
            if let Some(threshold) = opts.threshold {
                if score < threshold {
                    continue;
                }
            }
            let Some(hit) = self.to_hit(&id, score)? else { continue };
            if let Some(collection) = &opts.collection {
                if hit.collection.as_deref() != Some(collection.as_str()) {
                    continue;
                }
            }
            hits.push(hit);
        }
        hits.truncate(opts.top_k);
        Ok(hits)
    }

    /// Vector search post-filtered by an arbitrary metadata predicate,
    /// widening the ANN candidate set and retrying until `top_k` is
    /// met or the expansion cap is hit.
    pub fn search_with_filter(
        &self,
        query: &[f32],
        opts: &SearchOptions,
        filter: &MetadataFilter<'_>,
    ) -> Result<Vec<ScoredHit>> {
        opts.cancellation.check()?;
        let dim = *self.dimension.read();
        let query = dim_adapter::adapt(query, dim, self.config.auto_dim_adapt)?;
        let ef = opts.ef_search.unwrap_or(self.config.hnsw.ef_search);

        let mut expand = (opts.top_k * FILTER_EXPANSION_FACTOR).max(FILTER_MIN_CANDIDATES);
        loop {
            opts.cancellation.check()?;
            let raw = self.raw_search(&query, expand, ef);
            let mut hits = Vec::new();
            for (id, score) in &raw {
                if let Some(threshold) = opts.threshold {
                    if *score < threshold {
                        continue;
                    }
                }
                let Some(hit) = self.to_hit(id, *score)? else { continue };
                if !filter(&hit.metadata) {
                    continue;
                }
                if let Some(collection) = &opts.collection {
                    if hit.collection.as_deref() != Some(collection.as_str()) {
                        continue;
                    }
                }
                hits.push(hit);
            }
            if hits.len() >= opts.top_k || expand >= FILTER_EXPANSION_CAP || expand >= raw.len() {
                hits.truncate(opts.top_k);
                return Ok(hits);
            }
            expand = (expand * FILTER_EXPANSION_FACTOR).min(FILTER_EXPANSION_CAP);
        }
    }

    /// Vector search restricted to rows visible under `roles`: a row
    /// with a non-empty ACL is visible only if it intersects `roles`.
    /// Rows with an empty ACL are public.
    pub fn search_with_acl(
        &self,
        query: &[f32],
        roles: &HashSet<String>,
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredHit>> {
        let filter_roles = roles.clone();
        self.search_with_filtered_acl(query, opts, move |acl: &HashSet<String>| {
            acl.is_empty() || !acl.is_disjoint(&filter_roles)
        })
    }

    fn search_with_filtered_acl(
        &self,
        query: &[f32],
        opts: &SearchOptions,
        acl_ok: impl Fn(&HashSet<String>) -> bool,
    ) -> Result<Vec<ScoredHit>> {
        opts.cancellation.check()?;
        let dim = *self.dimension.read();
        let query = dim_adapter::adapt(query, dim, self.config.auto_dim_adapt)?;
        let ef = opts.ef_search.unwrap_or(self.config.hnsw.ef_search);

        let mut expand = (opts.top_k * FILTER_EXPANSION_FACTOR).max(FILTER_MIN_CANDIDATES);
        loop {
            opts.cancellation.check()?;
            let raw = self.raw_search(&query, expand, ef);
            let mut hits = Vec::new();
            for (id, score) in &raw {
                if let Some(threshold) = opts.threshold {
                    if *score < threshold {
                        continue;
                    }
                }
                let mut persistence = self.persistence.lock();
                let Some(row) = persistence.get_embedding(id)? else { continue };
                drop(persistence);
                if row.tombstoned {
                    continue;
                }
                let payload = row_to_payload(&row)?;
                if !acl_ok(&payload.acl) {
                    continue;
                }
                if let Some(collection) = &opts.collection {
                    if payload.collection.as_deref() != Some(collection.as_str()) {
                        continue;
                    }
                }
                hits.push(ScoredHit {
                    id: payload.id,
                    score: *score,
                    content: payload.content,
                    doc_id: payload.doc_id,
                    collection: payload.collection,
                    metadata: payload.metadata,
                });
            }
            if hits.len() >= opts.top_k || expand >= FILTER_EXPANSION_CAP || expand >= raw.len() {
                hits.truncate(opts.top_k);
                return Ok(hits);
            }
            expand = (expand * FILTER_EXPANSION_FACTOR).min(FILTER_EXPANSION_CAP);
        }
    }

    /// Combined vector + keyword search, fused by Reciprocal Rank
    /// Fusion.
    pub fn hybrid_search(&self, query: &HybridQuery, opts: &SearchOptions) -> Result<Vec<ScoredHit>> {
        opts.cancellation.check()?;
        let dim = *self.dimension.read();
        let vector = dim_adapter::adapt(&query.vector, dim, self.config.auto_dim_adapt)?;
        let ef = opts.ef_search.unwrap_or(self.config.hnsw.ef_search);

        let expand = (opts.top_k * FILTER_EXPANSION_FACTOR).max(FILTER_MIN_CANDIDATES);
        let vector_hits = self.raw_search(&vector, expand, ef);
        let vector_ranked: Vec<RankedHit> = vector_hits
            .iter()
            .enumerate()
            .map(|(i, (id, _))| RankedHit { id: id.clone(), rank: i + 1 })
            .collect();

        let keyword_hits = {
            let persistence = self.persistence.lock();
            persistence.fts_search(&query.text, expand)?
        };
        let keyword_ranked: Vec<RankedHit> = keyword_hits
            .iter()
            .enumerate()
            .map(|(i, (id, _))| RankedHit { id: id.clone(), rank: i + 1 })
            .collect();

        let mut fused: Vec<FusedHit> = fuser::fuse_weighted(
            &vector_ranked,
            &keyword_ranked,
            query.vector_weight,
            query.keyword_weight,
            query.k_rrf,
        )?;

        if !self.config.text_similarity.allow_score_above_one {
            for hit in &mut fused {
                hit.score = hit.score.clamp(0.0, 1.0);
            }
        }

        let mut hits = Vec::with_capacity(opts.top_k);
        for hit in fused {
            if hits.len() >= opts.top_k {
                break;
            }
            if let Some(threshold) = opts.threshold {
                if hit.score < threshold {
                    continue;
                }
            }
            let Some(scored) = self.to_hit(&hit.id, hit.score)? else { continue };
            if let Some(collection) = &opts.collection {
                if scored.collection.as_deref() != Some(collection.as_str()) {
                    continue;
                }
            }
            hits.push(scored);
        }
        Ok(hits)
    }

    /// Remove `id` from both the index and the durable store.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut index = self.index.write();
        let mut persistence = self.persistence.lock();
        persistence.delete_by_id(id)?;
        index.delete(id)?;
        Ok(())
    }

    /// Remove a document and every embedding belonging to it (spec §3:
    /// "a document owns zero or more embeddings; deleting a document
    /// deletes its embeddings").
    pub fn delete_by_doc_id(&self, doc_id: &str) -> Result<usize> {
        let mut index = self.index.write();
        let mut persistence = self.persistence.lock();
        let arena_len = index.stats().live_nodes + index.stats().tombstoned_nodes;
        let ids: Vec<String> = (0..arena_len)
            .map(|i| index.id_of(crate::hnsw::layer::NodeHandle(i as u64)).to_string())
            .collect();

        let deleted = persistence.delete_by_doc_id(doc_id)?;
        persistence.delete_document(doc_id)?;
        for id in ids {
            if let Ok(Some(_)) = persistence.get_embedding(&id) {
                continue;
            }
            let _ = index.delete(&id);
        }
        Ok(deleted)
    }

    pub fn upsert_document(&self, doc: Document) -> Result<()> {
        let row = DocumentRow {
            doc_id: doc.doc_id,
            title: doc.title,
            author: doc.author,
            metadata_json: serde_json::to_string(&doc.metadata)
                .map_err(|e| VectorDbError::InvalidArgument(format!("metadata: {e}")))?,
        };
        self.persistence.lock().upsert_document(&row)
    }

    pub fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = self.persistence.lock().list_documents()?;
        rows.into_iter()
            .map(|row| {
                let metadata = serde_json::from_str(&row.metadata_json)
                    .map_err(|e| VectorDbError::Corrupted(format!("document metadata: {e}")))?;
                Ok(Document {
                    doc_id: row.doc_id,
                    title: row.title,
                    author: row.author,
                    metadata,
                })
            })
            .collect()
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> Result<Stats> {
        let index = self.index.read();
        let mut persistence = self.persistence.lock();
        Ok(Stats {
            live_embeddings: index.stats().live_nodes,
            tombstoned_embeddings: index.stats().tombstoned_nodes,
            documents: persistence.list_documents()?.len(),
            dimensions: *self.dimension.read(),
            hnsw: index.stats(),
        })
    }

    /// Rebuild the in-memory HNSW graph by reinserting every durable,
    /// non-tombstoned row in ID order, dropping tombstones entirely.
    /// This is the only operation that reclaims tombstone space.
    pub fn compact(&self) -> Result<()> {
        let mut index = self.index.write();
        index.compact();
        let mut persistence = self.persistence.lock();
        let arena_len = index.stats().live_nodes + index.stats().tombstoned_nodes;
        for i in 0..arena_len {
            let id = index.id_of(crate::hnsw::layer::NodeHandle(i as u64)).to_string();
            self.persist_edges(&mut persistence, &index, &id)?;
        }
        Ok(())
    }

    /// Discard the in-memory index and rebuild it from durable rows.
    /// Used after detecting corruption or to recover from a crash
    /// mid-write.
    pub fn rebuild_from_rows(&self) -> Result<()> {
        let mut persistence = self.persistence.lock();
        let dim = *self.dimension.read();
        let rebuilt = reload_index(&mut persistence, self.config.similarity, self.hnsw_params(), dim)?;
        *self.index.write() = rebuilt;
        Ok(())
    }
}

fn similarity_tag(similarity: Similarity) -> &'static str {
    match similarity {
        Similarity::Cosine => "cosine",
        Similarity::Dot => "dot",
        Similarity::Euclidean => "euclidean",
    }
}

/// Rebuild the in-memory HNSW graph from durable rows: restore every
/// node at the level implied by how many layers it has persisted
/// adjacency for, wire up persisted edges, then recompute the entry
/// point. Nodes with no persisted edges (e.g. written by a version
/// that predates compaction) still restore at level 0 with no
/// neighbors; a subsequent `compact()` will reconnect them correctly.
fn reload_index(
    persistence: &mut PersistenceAdapter,
    similarity: Similarity,
    params: HnswParams,
    dimension: usize,
) -> Result<HnswIndex> {
    let mut index = HnswIndex::new(similarity, params);
    if dimension == 0 {
        return Ok(index);
    }
    let rows = persistence.iter_all_embeddings()?;

    let mut edges_by_id: HashMap<String, Vec<(i32, String)>> = HashMap::new();
    let mut handles: HashMap<String, crate::hnsw::layer::NodeHandle> = HashMap::new();

    for row in &rows {
        let vector = decode_vector(&row.vector)?;
        if vector.len() != dimension {
            return Err(VectorDbError::Corrupted(format!(
                "embedding {} has {} dims, store dimension is {dimension}",
                row.id,
                vector.len()
            )));
        }
        let edges = persistence.load_graph_edges(&row.id)?;
        let level = edges.iter().map(|(layer, _)| *layer as usize).max().unwrap_or(0);
        let handle = index.restore_node(row.id.clone(), vector, level, row.tombstoned);
        handles.insert(row.id.clone(), handle);
        edges_by_id.insert(row.id.clone(), edges);
    }

    for (id, edges) in &edges_by_id {
        let handle = handles[id];
        for (layer, neighbors_json) in edges {
            let neighbor_ids: Vec<String> = serde_json::from_str(neighbors_json)
                .map_err(|e| VectorDbError::Corrupted(format!("graph_edges for {id}: {e}")))?;
            let neighbor_handles: Vec<_> = neighbor_ids
                .iter()
                .filter_map(|nid| handles.get(nid).copied())
                .collect();
            index.set_neighbors(handle, *layer as usize, neighbor_handles);
        }
    }
    index.finalize_restore();
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_config(path: &str) -> StoreConfig {
        StoreConfig {
            path: path.to_string(),
            dimensions: 4,
            ..Default::default()
        }
    }

    fn scratch() -> (NamedTempFile, VectorStore) {
        let file = NamedTempFile::new().unwrap();
        let store = VectorStore::open(test_config(file.path().to_str().unwrap())).unwrap();
        (file, store)
    }

    #[test]
    fn upsert_then_search_finds_exact_match() {
        let (_file, store) = scratch();
        store.upsert(Embedding::new("a", vec![1.0, 0.0, 0.0, 0.0])).unwrap();
        store.upsert(Embedding::new("b", vec![0.0, 1.0, 0.0, 0.0])).unwrap();

        let hits = store
            .search(&[1.0, 0.0, 0.0, 0.0], &SearchOptions { top_k: 1, ..Default::default() })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].score > 0.99);
    }

    #[test]
    fn upsert_is_idempotent_by_id() {
        let (_file, store) = scratch();
        store.upsert(Embedding::new("a", vec![1.0, 0.0, 0.0, 0.0]).with_content("first")).unwrap();
        store.upsert(Embedding::new("a", vec![0.0, 1.0, 0.0, 0.0]).with_content("second")).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.live_embeddings, 1);

        let hits = store
            .search(&[0.0, 1.0, 0.0, 0.0], &SearchOptions { top_k: 1, ..Default::default() })
            .unwrap();
        assert_eq!(hits[0].content.as_deref(), Some("second"));
    }

    #[test]
    fn delete_removes_from_search_results() {
        let (_file, store) = scratch();
        store.upsert(Embedding::new("a", vec![1.0, 0.0, 0.0, 0.0])).unwrap();
        store.delete("a").unwrap();

        let hits = store
            .search(&[1.0, 0.0, 0.0, 0.0], &SearchOptions { top_k: 5, ..Default::default() })
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn search_with_acl_hides_disjoint_rows() {
        let (_file, store) = scratch();
        let mut secret = Embedding::new("secret", vec![1.0, 0.0, 0.0, 0.0]);
        secret.acl.insert("admins".into());
        store.upsert(secret).unwrap();
        store.upsert(Embedding::new("public", vec![1.0, 0.01, 0.0, 0.0])).unwrap();

        let roles: HashSet<String> = HashSet::new();
        let hits = store
            .search_with_acl(&[1.0, 0.0, 0.0, 0.0], &roles, &SearchOptions { top_k: 5, ..Default::default() })
            .unwrap();
        assert!(hits.iter().all(|h| h.id != "secret"));
        assert!(hits.iter().any(|h| h.id == "public"));
    }

    #[test]
    fn upsert_batch_is_all_or_nothing_on_dimension_error() {
        let (_file, store) = scratch();
        let batch = vec![
            Embedding::new("a", vec![1.0, 0.0, 0.0, 0.0]),
            Embedding::new("b", vec![1.0, 2.0, 3.0]), // wrong length under Smart it still adapts via pad, so force Strict
        ];
        // Smart mode pads/truncates rather than erroring, so this batch
        // actually succeeds; assert both rows landed together.
        store.upsert_batch(batch).unwrap();
        assert_eq!(store.stats().unwrap().live_embeddings, 2);
    }

    #[test]
    fn compact_drops_tombstones_and_keeps_live_rows_searchable() {
        let (_file, store) = scratch();
        store.upsert(Embedding::new("a", vec![1.0, 0.0, 0.0, 0.0])).unwrap();
        store.upsert(Embedding::new("b", vec![0.0, 1.0, 0.0, 0.0])).unwrap();
        store.delete("a").unwrap();
        store.compact().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.live_embeddings, 1);
        assert_eq!(stats.tombstoned_embeddings, 0);
    }

    #[test]
    fn delete_by_doc_id_removes_document_row_too() {
        let (_file, store) = scratch();
        store
            .upsert(Embedding::new("a", vec![1.0, 0.0, 0.0, 0.0]).with_doc_id("doc_2"))
            .unwrap();
        store
            .upsert(Embedding::new("b", vec![0.0, 1.0, 0.0, 0.0]).with_doc_id("doc_2"))
            .unwrap();
        store
            .upsert_document(Document { doc_id: "doc_2".into(), ..Default::default() })
            .unwrap();

        let deleted = store.delete_by_doc_id("doc_2").unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.stats().unwrap().live_embeddings, 0);
        assert!(!store.list_documents().unwrap().iter().any(|d| d.doc_id == "doc_2"));
    }

    #[test]
    fn search_orders_by_descending_cosine_similarity() {
        let file = NamedTempFile::new().unwrap();
        let config = StoreConfig { path: file.path().to_str().unwrap().to_string(), dimensions: 3, ..Default::default() };
        let store = VectorStore::open(config).unwrap();

        store.upsert(Embedding::new("a", vec![1.0, 0.0, 0.0])).unwrap();
        store.upsert(Embedding::new("b", vec![0.0, 1.0, 0.0])).unwrap();
        store.upsert(Embedding::new("c", vec![0.0, 0.0, 1.0])).unwrap();
        store.upsert(Embedding::new("d", vec![0.707, 0.707, 0.0])).unwrap();

        let hits = store.search(&[1.0, 0.0, 0.0], &SearchOptions { top_k: 3, ..Default::default() }).unwrap();
        assert_eq!(hits[0].id, "a");
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert_eq!(hits[1].id, "d");
        assert!((hits[1].score - 0.707).abs() < 1e-2);
    }

    #[test]
    fn auto_dimension_fixes_on_first_write_and_smart_adapts_later_writes() {
        let file = NamedTempFile::new().unwrap();
        let config = StoreConfig { path: file.path().to_str().unwrap().to_string(), dimensions: 0, ..Default::default() };
        let store = VectorStore::open(config).unwrap();

        store.upsert(Embedding::new("a", vec![1.0; 768])).unwrap();
        assert_eq!(store.stats().unwrap().dimensions, 768);

        store.upsert(Embedding::new("b", vec![1.0; 1536])).unwrap();
        let hits = store.search(&vec![1.0; 768], &SearchOptions { top_k: 2, ..Default::default() }).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn hybrid_search_finds_keyword_only_match() {
        let (_file, store) = scratch();
        store
            .upsert(Embedding::new("a", vec![1.0, 0.0, 0.0, 0.0]).with_content("the quick brown fox"))
            .unwrap();
        store
            .upsert(Embedding::new("b", vec![0.0, 0.0, 0.0, 1.0]).with_content("lazy dog sleeps"))
            .unwrap();

        let query = HybridQuery::new(vec![1.0, 0.0, 0.0, 0.0], "lazy dog");
        let hits = store.hybrid_search(&query, &SearchOptions { top_k: 5, ..Default::default() }).unwrap();
        assert!(hits.iter().any(|h| h.id == "b"));
    }
}
