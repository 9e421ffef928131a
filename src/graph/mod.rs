//! The graph overlay: typed nodes and edges layered on top of
//! the embedding store, with traversal, shortest path, PageRank,
//! community detection, a graph-aware hybrid search, and edge
//! prediction.
//!
//! A node extends an embedding with a type tag and free-form
//! properties; its vector, content, and ACL still live
//! in the `embeddings` table and are reached through
//! [`crate::store::VectorStore::get_vector`]. Edges are typed and
//! weighted, indexed on both endpoints, and cascade-deleted with their
//! node.

pub mod algorithms;

use std::collections::{HashMap, HashSet};

use crate::error::{Result, VectorDbError};
use crate::models::{EdgeRow, NodeRow};
use crate::similarity::Similarity;
use crate::store::{ScoredHit, VectorStore};
use algorithms::Adjacency;

/// A graph-overlay node: a type tag and properties keyed to an
/// existing embedding row by sharing its ID.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    pub id: String,
    pub node_type: String,
    pub properties: HashMap<String, String>,
}

/// A directed, typed, weighted edge between two nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub id: Option<i32>,
    pub from_id: String,
    pub to_id: String,
    pub edge_type: String,
    pub weight: f64,
}

/// Which direction(s) of edge to follow from a node during traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    Both,
}

/// Options for [`GraphOverlay::neighbors`].
#[derive(Debug, Clone)]
pub struct NeighborOptions {
    pub max_depth: usize,
    pub direction: Direction,
    pub edge_types: Option<HashSet<String>>,
    pub limit: Option<usize>,
}

impl Default for NeighborOptions {
    fn default() -> Self {
        Self {
            max_depth: 3,
            direction: Direction::Both,
            edge_types: None,
            limit: None,
        }
    }
}

/// A vector + graph-proximity query for [`GraphOverlay::hybrid_search`].
#[derive(Debug, Clone)]
pub struct HybridGraphQuery {
    pub vector: Vec<f32>,
    /// The node BFS distance and edge confidence are measured from.
    pub start_node: String,
    pub top_k: usize,
    pub vector_weight: f32,
    pub graph_weight: f32,
    pub edge_weight: f32,
}

impl HybridGraphQuery {
    pub fn new(vector: Vec<f32>, start_node: impl Into<String>) -> Self {
        Self {
            vector,
            start_node: start_node.into(),
            top_k: 10,
            vector_weight: 0.5,
            graph_weight: 0.3,
            edge_weight: 0.2,
        }
    }
}

fn node_from_row(row: NodeRow) -> Result<Node> {
    let properties = serde_json::from_str(&row.properties_json)
        .map_err(|e| VectorDbError::Corrupted(format!("node properties for {}: {e}", row.id)))?;
    Ok(Node { id: row.id, node_type: row.node_type, properties })
}

fn edge_from_row(row: EdgeRow) -> Edge {
    Edge {
        id: row.id,
        from_id: row.from_id,
        to_id: row.to_id,
        edge_type: row.edge_type,
        weight: row.weight,
    }
}

impl VectorStore {
    /// Borrow the graph overlay. Cheap; the overlay loads its own
    /// adjacency snapshot per traversal call rather than caching one.
    pub fn graph(&self) -> GraphOverlay<'_> {
        GraphOverlay { store: self }
    }
}

/// The graph overlay's operations, borrowed from a [`VectorStore`].
pub struct GraphOverlay<'a> {
    store: &'a VectorStore,
}

impl<'a> GraphOverlay<'a> {
    pub fn upsert_node(&self, node: Node) -> Result<()> {
        let row = NodeRow {
            id: node.id,
            node_type: node.node_type,
            properties_json: serde_json::to_string(&node.properties)
                .map_err(|e| VectorDbError::InvalidArgument(format!("properties: {e}")))?,
        };
        self.store.persistence_lock().upsert_node(&row)
    }

    pub fn get_node(&self, id: &str) -> Result<Option<Node>> {
        match self.store.persistence_lock().get_node(id)? {
            Some(row) => Ok(Some(node_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Delete `id` and cascade-delete every edge touching it.
    pub fn delete_node(&self, id: &str) -> Result<()> {
        self.store.persistence_lock().delete_node(id)
    }

    /// Add a directed edge. Fails with [`VectorDbError::NotFound`] if
    /// either endpoint isn't a registered node.
    pub fn insert_edge(&self, from_id: &str, to_id: &str, edge_type: &str, weight: f64) -> Result<()> {
        let mut persistence = self.store.persistence_lock();
        if persistence.get_node(from_id)?.is_none() {
            return Err(VectorDbError::NotFound(from_id.to_string()));
        }
        if persistence.get_node(to_id)?.is_none() {
            return Err(VectorDbError::NotFound(to_id.to_string()));
        }
        persistence.insert_edge(&EdgeRow {
            id: None,
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            edge_type: edge_type.to_string(),
            weight,
        })
    }

    pub fn edges_from(&self, id: &str) -> Result<Vec<Edge>> {
        Ok(self.store.persistence_lock().list_edges_from(id)?.into_iter().map(edge_from_row).collect())
    }

    pub fn edges_to(&self, id: &str) -> Result<Vec<Edge>> {
        Ok(self.store.persistence_lock().list_edges_to(id)?.into_iter().map(edge_from_row).collect())
    }

    fn load_adjacency(&self) -> Result<Adjacency> {
        let mut persistence = self.store.persistence_lock();
        let nodes: Vec<String> = persistence.list_nodes()?.into_iter().map(|n| n.id).collect();
        let edges = persistence.list_all_edges()?;
        drop(persistence);

        let mut adjacency = Adjacency::new(nodes);
        for edge in edges {
            adjacency.add_edge(&edge.from_id, &edge.to_id, edge.weight, &edge.edge_type);
        }
        Ok(adjacency)
    }

    /// Breadth-first traversal from `start`. See [`NeighborOptions`].
    pub fn neighbors(
        &self,
        start: &str,
        opts: &NeighborOptions,
    ) -> Result<Vec<(String, usize)>> {
        self.neighbors_checked(start, opts, &crate::cancellation::CancellationToken::none())
    }

    pub fn neighbors_checked(
        &self,
        start: &str,
        opts: &NeighborOptions,
        cancellation: &crate::cancellation::CancellationToken,
    ) -> Result<Vec<(String, usize)>> {
        let adjacency = self.load_adjacency()?;
        algorithms::bfs(&adjacency, start, opts, cancellation)
    }

    /// Dijkstra shortest path, edge weights reinterpreted as costs.
    pub fn shortest_path(&self, a: &str, b: &str) -> Result<(Vec<String>, f64)> {
        let adjacency = self.load_adjacency()?;
        algorithms::shortest_path(&adjacency, a, b, &crate::cancellation::CancellationToken::none())
    }

    /// PageRank over the graph overlay's weighted adjacency.
    pub fn pagerank(&self, iters: usize, damping: f64) -> Result<HashMap<String, f64>> {
        let adjacency = self.load_adjacency()?;
        algorithms::pagerank(&adjacency, iters, damping, &crate::cancellation::CancellationToken::none())
    }

    /// Label-propagation community detection. Returns each node's
    /// community, represented by the ID of one of its members.
    pub fn community_detection(&self) -> Result<HashMap<String, String>> {
        let adjacency = self.load_adjacency()?;
        algorithms::label_propagation(&adjacency, &crate::cancellation::CancellationToken::none())
    }

    /// Vector similarity combined with graph proximity and edge
    /// confidence from `query.start_node`:
    ///
    /// `combined = w_v * s_vec + w_g * s_graph + w_e * s_edge`
    ///
    /// `s_graph` is `1 / (1 + bfs_distance)` from the start node (`0`
    /// if unreachable within the traversal), `s_edge` is the mean edge
    /// weight along the shortest path. Weights are renormalized to sum
    /// to `1` and must be non-negative.
    pub fn hybrid_search(&self, query: &HybridGraphQuery) -> Result<Vec<ScoredHit>> {
        if query.vector_weight < 0.0 || query.graph_weight < 0.0 || query.edge_weight < 0.0 {
            return Err(VectorDbError::InvalidArgument(
                "hybrid search weights must be non-negative".into(),
            ));
        }
        let total_weight = query.vector_weight + query.graph_weight + query.edge_weight;
        if total_weight <= 0.0 {
            return Err(VectorDbError::InvalidArgument(
                "hybrid search weights must not all be zero".into(),
            ));
        }
        let (wv, wg, we) = (
            query.vector_weight / total_weight,
            query.graph_weight / total_weight,
            query.edge_weight / total_weight,
        );

        let adjacency = self.load_adjacency()?;
        let cancellation = crate::cancellation::CancellationToken::none();
        let reachable = algorithms::bfs(
            &adjacency,
            &query.start_node,
            &NeighborOptions { max_depth: 64, ..Default::default() },
            &cancellation,
        )?;
        let depth_by_id: HashMap<String, usize> = reachable.into_iter().collect();

        let candidates: Vec<&String> = adjacency.nodes.iter().collect();
        let mut scored = Vec::new();
        for id in candidates {
            if id == &query.start_node {
                continue;
            }
            let Some(vector) = self.store.get_vector(id)? else { continue };
            let s_vec = self.store.similarity().score(&query.vector, &vector).unwrap_or(0.0);

            let s_graph = depth_by_id.get(id).map(|&d| 1.0 / (1.0 + d as f32)).unwrap_or(0.0);

            let s_edge = match algorithms::shortest_path(&adjacency, &query.start_node, id, &cancellation) {
                Ok((path, _)) if path.len() >= 2 => mean_edge_weight(&adjacency, &path),
                _ => 0.0,
            };

            let combined = wv * s_vec + wg * s_graph + we * s_edge;
            let Some(mut hit) = self.hydrate_hit(id, combined)? else { continue };
            hit.score = combined;
            scored.push(hit);
        }

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.id.cmp(&b.id)));
        scored.truncate(query.top_k);
        Ok(scored)
    }

    fn hydrate_hit(&self, id: &str, score: f32) -> Result<Option<ScoredHit>> {
        let mut persistence = self.store.persistence_lock();
        let Some(row) = persistence.get_embedding(id)? else { return Ok(None) };
        if row.tombstoned {
            return Ok(None);
        }
        let metadata = serde_json::from_str(&row.metadata_json)
            .map_err(|e| VectorDbError::Corrupted(format!("metadata_json for {id}: {e}")))?;
        Ok(Some(ScoredHit {
            id: row.id,
            score,
            content: row.content,
            doc_id: row.doc_id,
            collection: row.collection,
            metadata,
        }))
    }

    /// Score candidates not currently linked from `source` by combined
    /// common-neighbors count, Adamic-Adar index, and vector
    /// similarity, returning the top `k`.
    pub fn predict_edges(&self, source: &str, k: usize) -> Result<Vec<(String, f32)>> {
        let adjacency = self.load_adjacency()?;
        if !adjacency.nodes.contains(source) {
            return Err(VectorDbError::NotFound(source.to_string()));
        }
        let already_linked: HashSet<String> = adjacency
            .undirected_neighbor_ids(source)
            .into_iter()
            .collect();
        let source_vector = self.store.get_vector(source)?;

        let mut scored: Vec<(String, f32)> = Vec::new();
        for candidate in &adjacency.nodes {
            if candidate == source || already_linked.contains(candidate) {
                continue;
            }
            let (common, adamic_adar) = algorithms::common_neighbors_and_adamic_adar(&adjacency, source, candidate);
            let vector_similarity = match (&source_vector, self.store.get_vector(candidate)?) {
                (Some(a), Some(b)) => self.store.similarity().score(a, &b).unwrap_or(0.0),
                _ => 0.0,
            };
            let score = common as f32 + adamic_adar + vector_similarity;
            scored.push((candidate.clone(), score));
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }
}

fn mean_edge_weight(adjacency: &Adjacency, path: &[String]) -> f32 {
    if path.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0f32;
    let mut count = 0;
    for pair in path.windows(2) {
        if let Some(w) = adjacency.edge_weight_between(&pair[0], &pair[1]) {
            total += w as f32;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use tempfile::NamedTempFile;

    fn scratch_store() -> (NamedTempFile, VectorStore) {
        let file = NamedTempFile::new().unwrap();
        let config = StoreConfig {
            path: file.path().to_str().unwrap().to_string(),
            dimensions: 4,
            ..Default::default()
        };
        (file, VectorStore::open(config).unwrap())
    }

    #[test]
    fn insert_edge_requires_existing_endpoints() {
        let (_file, store) = scratch_store();
        let graph = store.graph();
        let result = graph.insert_edge("a", "b", "links_to", 1.0);
        assert!(result.is_err());
    }

    #[test]
    fn neighbors_traverses_a_chain() {
        let (_file, store) = scratch_store();
        let graph = store.graph();
        for id in ["a", "b", "c"] {
            graph.upsert_node(Node { id: id.to_string(), node_type: "doc".into(), properties: HashMap::new() }).unwrap();
        }
        graph.insert_edge("a", "b", "links_to", 1.0).unwrap();
        graph.insert_edge("b", "c", "links_to", 1.0).unwrap();

        let result = graph.neighbors("a", &NeighborOptions { direction: Direction::Out, ..Default::default() }).unwrap();
        let ids: Vec<&str> = result.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn delete_node_cascades_edges() {
        let (_file, store) = scratch_store();
        let graph = store.graph();
        graph.upsert_node(Node { id: "a".into(), node_type: "doc".into(), properties: HashMap::new() }).unwrap();
        graph.upsert_node(Node { id: "b".into(), node_type: "doc".into(), properties: HashMap::new() }).unwrap();
        graph.insert_edge("a", "b", "links_to", 1.0).unwrap();

        graph.delete_node("a").unwrap();
        assert!(graph.edges_from("a").unwrap().is_empty());
        assert!(graph.get_node("a").unwrap().is_none());
    }

    #[test]
    fn predict_edges_errors_for_unknown_source() {
        let (_file, store) = scratch_store();
        assert!(store.graph().predict_edges("ghost", 5).is_err());
    }
}
