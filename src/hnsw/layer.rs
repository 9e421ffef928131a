//! Arena node handles and the per-node adjacency representation used by
//! the HNSW graph. The graph is inherently cyclic, so nodes are
//! addressed by a stable integer handle into an arena rather than by
//! direct reference, and neighbor lists are vectors of handles.

use std::cmp::Ordering;

/// A stable handle into the HNSW node arena. Cheaper to hash/compare
/// than the string ID it corresponds to. Valid only for the lifetime of
/// the in-memory index; persisted edges key on the string ID instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(pub u64);

/// A single node in the HNSW graph: its level and one adjacency list
/// per layer from `0` to `level` inclusive. Tombstoned nodes remain in
/// the graph (so edges stay traversable) but are suppressed from
/// search results.
#[derive(Debug, Clone)]
pub struct HnswNode {
    pub level: usize,
    pub neighbors: Vec<Vec<NodeHandle>>,
    pub tombstoned: bool,
}

impl HnswNode {
    pub fn new(level: usize) -> Self {
        Self {
            level,
            neighbors: vec![Vec::new(); level + 1],
            tombstoned: false,
        }
    }
}

/// `f32` wrapper implementing `Ord` so distances can live in a
/// `BinaryHeap`. NaN never arises here (similarity kernels guard
/// against it), so total ordering falls back to `Equal` only in that
/// unreachable case.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderedDistance(pub f32);

impl Eq for OrderedDistance {}

impl PartialOrd for OrderedDistance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedDistance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

/// A candidate found during beam search: its handle and distance to
/// the query (smaller is closer, uniformly across similarity kernels).
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub distance: OrderedDistance,
    pub handle: NodeHandle,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.handle == other.handle
    }
}
impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.handle.cmp(&other.handle))
    }
}
