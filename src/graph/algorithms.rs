//! Pure graph algorithms over an in-memory adjacency snapshot:
//! breadth-first traversal, Dijkstra shortest path, PageRank, and label
//! propagation community detection. None of these touch the
//! persistence adapter directly — `graph::GraphOverlay` loads the
//! snapshot once per call and hands it to these functions, which keeps
//! the algorithms themselves trivially testable against hand-built
//! graphs.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use crate::cancellation::CancellationToken;
use crate::error::{Result, VectorDbError};

use super::{Direction, NeighborOptions};

/// One outgoing (or, in the reverse index, incoming) connection.
#[derive(Debug, Clone)]
pub struct AdjEdge {
    pub other: String,
    pub weight: f64,
    pub edge_type: String,
}

/// An adjacency snapshot built once from the `edges` table: forward
/// and reverse indices keyed by node ID, plus the full node-ID set so
/// isolated nodes are still visitable.
#[derive(Debug, Default)]
pub struct Adjacency {
    pub nodes: HashSet<String>,
    out: HashMap<String, Vec<AdjEdge>>,
    in_: HashMap<String, Vec<AdjEdge>>,
}

impl Adjacency {
    pub fn new(nodes: impl IntoIterator<Item = String>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
            out: HashMap::new(),
            in_: HashMap::new(),
        }
    }

    pub fn add_edge(&mut self, from: &str, to: &str, weight: f64, edge_type: &str) {
        self.nodes.insert(from.to_string());
        self.nodes.insert(to.to_string());
        self.out.entry(from.to_string()).or_default().push(AdjEdge {
            other: to.to_string(),
            weight,
            edge_type: edge_type.to_string(),
        });
        self.in_.entry(to.to_string()).or_default().push(AdjEdge {
            other: from.to_string(),
            weight,
            edge_type: edge_type.to_string(),
        });
    }

    fn edges(&self, id: &str, direction: Direction) -> Vec<&AdjEdge> {
        match direction {
            Direction::Out => self.out.get(id).map(|v| v.iter().collect()).unwrap_or_default(),
            Direction::In => self.in_.get(id).map(|v| v.iter().collect()).unwrap_or_default(),
            Direction::Both => {
                let mut both: Vec<&AdjEdge> = Vec::new();
                if let Some(v) = self.out.get(id) {
                    both.extend(v.iter());
                }
                if let Some(v) = self.in_.get(id) {
                    both.extend(v.iter());
                }
                both
            }
        }
    }

    /// All neighbors in either direction, deduplicated, for label
    /// propagation and Adamic-Adar (both treat the graph as
    /// undirected).
    fn undirected_neighbors(&self, id: &str) -> Vec<&AdjEdge> {
        self.edges(id, Direction::Both)
    }

    /// Public view of [`Self::undirected_neighbors`] for callers
    /// outside this module, e.g. edge prediction's already-linked set.
    pub fn undirected_neighbor_ids(&self, id: &str) -> Vec<String> {
        self.undirected_neighbors(id).into_iter().map(|e| e.other.clone()).collect()
    }

    /// The weight of the first outgoing edge `from -> to`, if any.
    /// Used to score a shortest path's mean edge confidence.
    pub fn edge_weight_between(&self, from: &str, to: &str) -> Option<f64> {
        self.out.get(from)?.iter().find(|e| e.other == to).map(|e| e.weight)
    }
}

/// Breadth-first traversal from `start`, respecting `opts.max_depth`,
/// `opts.direction`, and `opts.edge_types`. Cycles are handled by a
/// visited set. Results are ordered by BFS layer, then ascending edge
/// weight within a layer.
pub fn bfs(
    adjacency: &Adjacency,
    start: &str,
    opts: &NeighborOptions,
    cancellation: &CancellationToken,
) -> Result<Vec<(String, usize)>> {
    if !adjacency.nodes.contains(start) {
        return Err(VectorDbError::NotFound(start.to_string()));
    }

    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(start.to_string());
    let mut frontier: VecDeque<String> = VecDeque::new();
    frontier.push_back(start.to_string());
    let mut out: Vec<(String, usize)> = Vec::new();

    for depth in 1..=opts.max_depth {
        cancellation.check()?;
        if frontier.is_empty() {
            break;
        }
        let mut next_layer: Vec<(String, f64)> = Vec::new();
        let mut next_frontier = VecDeque::new();

        while let Some(node) = frontier.pop_front() {
            for edge in adjacency.edges(&node, opts.direction) {
                if let Some(types) = &opts.edge_types {
                    if !types.contains(&edge.edge_type) {
                        continue;
                    }
                }
                if visited.contains(&edge.other) {
                    continue;
                }
                visited.insert(edge.other.clone());
                next_layer.push((edge.other.clone(), edge.weight));
                next_frontier.push_back(edge.other.clone());
            }
        }

        next_layer.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        for (id, _) in next_layer {
            out.push((id, depth));
            if let Some(limit) = opts.limit {
                if out.len() >= limit {
                    return Ok(out);
                }
            }
        }
        frontier = next_frontier;
    }
    Ok(out)
}

/// Reinterpret an edge weight as a Dijkstra cost: `1 - weight` for
/// weights in `[0, 1]`, else `1 / weight`. The result is clamped away
/// from zero and to non-negative, since Dijkstra's correctness depends
/// on non-negative edge costs.
fn edge_cost(weight: f64) -> f64 {
    let cost = if (0.0..=1.0).contains(&weight) {
        1.0 - weight
    } else {
        1.0 / weight
    };
    cost.abs().max(f64::EPSILON)
}

#[derive(Debug, Clone, PartialEq)]
struct HeapEntry {
    cost: f64,
    node: String,
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the smallest cost.
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.node.cmp(&other.node))
    }
}

/// Dijkstra shortest path from `a` to `b` over the cost-reinterpreted
/// edge weights. Returns the node chain (inclusive of both endpoints)
/// and total distance, or `NotFound` if `b` is unreachable from `a`.
pub fn shortest_path(
    adjacency: &Adjacency,
    a: &str,
    b: &str,
    cancellation: &CancellationToken,
) -> Result<(Vec<String>, f64)> {
    if !adjacency.nodes.contains(a) {
        return Err(VectorDbError::NotFound(a.to_string()));
    }
    if !adjacency.nodes.contains(b) {
        return Err(VectorDbError::NotFound(b.to_string()));
    }
    if a == b {
        return Ok((vec![a.to_string()], 0.0));
    }

    let mut dist: HashMap<String, f64> = HashMap::new();
    let mut prev: HashMap<String, String> = HashMap::new();
    let mut heap = BinaryHeap::new();

    dist.insert(a.to_string(), 0.0);
    heap.push(HeapEntry { cost: 0.0, node: a.to_string() });

    while let Some(HeapEntry { cost, node }) = heap.pop() {
        cancellation.check()?;
        if node == b {
            break;
        }
        if cost > *dist.get(&node).unwrap_or(&f64::INFINITY) {
            continue;
        }
        for edge in adjacency.edges(&node, Direction::Out) {
            let next_cost = cost + edge_cost(edge.weight);
            if next_cost < *dist.get(&edge.other).unwrap_or(&f64::INFINITY) {
                dist.insert(edge.other.clone(), next_cost);
                prev.insert(edge.other.clone(), node.clone());
                heap.push(HeapEntry { cost: next_cost, node: edge.other.clone() });
            }
        }
    }

    let Some(&total) = dist.get(b) else {
        return Err(VectorDbError::NotFound(format!("no path from {a} to {b}")));
    };

    let mut chain = vec![b.to_string()];
    let mut cur = b.to_string();
    while cur != a {
        let Some(p) = prev.get(&cur) else {
            return Err(VectorDbError::NotFound(format!("no path from {a} to {b}")));
        };
        chain.push(p.clone());
        cur = p.clone();
    }
    chain.reverse();
    Ok((chain, total))
}

/// Power iteration PageRank over the weighted, directed adjacency with
/// uniform teleport. Dangling nodes (zero out-weight) redistribute
/// their mass uniformly, the standard fix for the basic random-surfer
/// model. Stops early once the L1 delta between iterations drops below
/// `1e-6`.
pub fn pagerank(
    adjacency: &Adjacency,
    iters: usize,
    damping: f64,
    cancellation: &CancellationToken,
) -> Result<HashMap<String, f64>> {
    let mut ids: Vec<String> = adjacency.nodes.iter().cloned().collect();
    ids.sort();
    let n = ids.len();
    if n == 0 {
        return Ok(HashMap::new());
    }
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

    let out_weight: Vec<f64> = ids
        .iter()
        .map(|id| adjacency.edges(id, Direction::Out).iter().map(|e| e.weight.max(0.0)).sum())
        .collect();

    let mut ranks = vec![1.0 / n as f64; n];
    let teleport = (1.0 - damping) / n as f64;

    for _ in 0..iters {
        cancellation.check()?;
        let dangling_mass: f64 = (0..n).filter(|&i| out_weight[i] <= 0.0).map(|i| ranks[i]).sum();
        let mut next = vec![teleport + damping * dangling_mass / n as f64; n];

        for (i, id) in ids.iter().enumerate() {
            if out_weight[i] <= 0.0 {
                continue;
            }
            for edge in adjacency.edges(id, Direction::Out) {
                let Some(&j) = index.get(edge.other.as_str()) else { continue };
                next[j] += damping * ranks[i] * edge.weight.max(0.0) / out_weight[i];
            }
        }

        let delta: f64 = next.iter().zip(&ranks).map(|(a, b)| (a - b).abs()).sum();
        ranks = next;
        if delta < 1e-6 {
            break;
        }
    }

    Ok(ids.into_iter().zip(ranks).collect())
}

/// Label propagation community detection: each node adopts the label
/// with the greatest total incident edge weight among its undirected
/// neighbors, synchronously (every node's update in a round sees only
/// the previous round's labels, so results are deterministic
/// regardless of iteration order). Stops when labels stop changing or
/// after 30 rounds; ties are broken by the numerically smallest label.
pub fn label_propagation(
    adjacency: &Adjacency,
    cancellation: &CancellationToken,
) -> Result<HashMap<String, String>> {
    const MAX_ROUNDS: usize = 30;

    let mut ids: Vec<String> = adjacency.nodes.iter().cloned().collect();
    ids.sort();
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    let mut labels: Vec<usize> = (0..ids.len()).collect();

    for _ in 0..MAX_ROUNDS {
        cancellation.check()?;
        let mut next = labels.clone();
        let mut changed = false;

        for (i, id) in ids.iter().enumerate() {
            let mut weight_by_label: HashMap<usize, f64> = HashMap::new();
            for edge in adjacency.undirected_neighbors(id) {
                let Some(&j) = index.get(edge.other.as_str()) else { continue };
                *weight_by_label.entry(labels[j]).or_insert(0.0) += edge.weight.abs();
            }
            if weight_by_label.is_empty() {
                continue;
            }
            let best = weight_by_label
                .into_iter()
                .fold(None, |best: Option<(usize, f64)>, (label, weight)| match best {
                    Some((bl, bw)) if bw > weight || (bw == weight && bl < label) => Some((bl, bw)),
                    _ => Some((label, weight)),
                })
                .map(|(label, _)| label)
                .unwrap();
            if best != next[i] {
                next[i] = best;
                changed = true;
            }
        }

        labels = next;
        if !changed {
            break;
        }
    }

    Ok(ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), ids[labels[i]].clone()))
        .collect())
}

/// Common-neighbors count and Adamic-Adar index between `source` and
/// `target`, over the undirected neighbor sets.
pub fn common_neighbors_and_adamic_adar(adjacency: &Adjacency, source: &str, target: &str) -> (usize, f32) {
    let source_neighbors: HashSet<&str> =
        adjacency.undirected_neighbors(source).into_iter().map(|e| e.other.as_str()).collect();
    let target_neighbors: HashSet<&str> =
        adjacency.undirected_neighbors(target).into_iter().map(|e| e.other.as_str()).collect();

    let common: Vec<&&str> = source_neighbors.intersection(&target_neighbors).collect();
    let adamic_adar: f32 = common
        .iter()
        .map(|&&z| {
            let degree = adjacency.undirected_neighbors(z).len() as f32;
            if degree > 1.0 {
                1.0 / degree.ln()
            } else {
                0.0
            }
        })
        .sum();
    (common.len(), adamic_adar)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Adjacency {
        let mut adj = Adjacency::new(["a".into(), "b".into(), "c".into()]);
        adj.add_edge("a", "b", 1.0, "links_to");
        adj.add_edge("b", "c", 1.0, "links_to");
        adj.add_edge("a", "c", 0.5, "links_to");
        adj
    }

    #[test]
    fn bfs_reaches_all_nodes_within_depth() {
        let adj = triangle();
        let result = bfs(&adj, "a", &NeighborOptions::default(), &CancellationToken::none()).unwrap();
        let ids: HashSet<&str> = result.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains("b"));
        assert!(ids.contains("c"));
    }

    #[test]
    fn bfs_respects_max_depth() {
        let mut adj = Adjacency::new(["a".into(), "b".into(), "c".into()]);
        adj.add_edge("a", "b", 1.0, "links_to");
        adj.add_edge("b", "c", 1.0, "links_to");
        let opts = NeighborOptions { max_depth: 1, ..Default::default() };
        let result = bfs(&adj, "a", &opts, &CancellationToken::none()).unwrap();
        assert_eq!(result, vec![("b".to_string(), 1)]);
    }

    #[test]
    fn shortest_path_prefers_direct_high_weight_edge() {
        let adj = triangle();
        let (path, _) = shortest_path(&adj, "a", "c", &CancellationToken::none()).unwrap();
        assert_eq!(path, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn shortest_path_errors_when_unreachable() {
        let mut adj = Adjacency::new(["a".into(), "b".into()]);
        adj.add_edge("a", "a", 1.0, "self"); // no path to b
        assert!(shortest_path(&adj, "a", "b", &CancellationToken::none()).is_err());
    }

    #[test]
    fn pagerank_ranks_sum_to_one() {
        let adj = triangle();
        let ranks = pagerank(&adj, 50, 0.85, &CancellationToken::none()).unwrap();
        let total: f64 = ranks.values().sum();
        assert!((total - 1.0).abs() < 1e-3, "ranks should sum to ~1, got {total}");
    }

    #[test]
    fn label_propagation_merges_a_fully_connected_triangle() {
        let adj = triangle();
        let labels = label_propagation(&adj, &CancellationToken::none()).unwrap();
        let distinct: HashSet<&String> = labels.values().collect();
        assert_eq!(distinct.len(), 1);
    }

    #[test]
    fn adamic_adar_is_zero_with_no_common_neighbors() {
        let mut adj = Adjacency::new(["a".into(), "b".into()]);
        adj.add_edge("a", "x", 1.0, "links_to");
        let (common, aa) = common_neighbors_and_adamic_adar(&adj, "a", "b");
        assert_eq!(common, 0);
        assert_eq!(aa, 0.0);
    }
}
