//! Product quantization (PQ): splits a `D`-dimensional vector into `M`
//! equal-width subspaces, each quantized against its own `K`-centroid
//! codebook trained by k-means. A PQ code is exactly `M` bytes, so `K`
//! must not exceed 256.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VectorDbError};

/// Maximum Lloyd iterations per subspace before giving up on
/// convergence.
const MAX_KMEANS_ITERS: usize = 25;
/// Convergence threshold on the relative change in total inertia
/// between iterations.
const INERTIA_TAU: f32 = 1e-4;

/// A trained (or untrained) product quantizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductQuantizer {
    /// Full vector dimension.
    d: usize,
    /// Number of subspaces.
    m: usize,
    /// Centroids per subspace (<= 256).
    k: usize,
    /// Width of each subspace (`d / m`).
    sub_dim: usize,
    /// `m` codebooks of `k x sub_dim` centroids. Empty until trained.
    codebooks: Vec<Vec<Vec<f32>>>,
    trained: bool,
}

impl ProductQuantizer {
    /// Construct an untrained quantizer for dimension `d` split into
    /// `m` subspaces with `k` centroids each.
    ///
    /// # Errors
    /// [`VectorDbError::InvalidArgument`] if `d % m != 0` or `k > 256`.
    pub fn new(d: usize, m: usize, k: usize) -> Result<Self> {
        if m == 0 || d % m != 0 {
            return Err(VectorDbError::InvalidArgument(format!(
                "dimension {d} is not divisible by subspace count {m}"
            )));
        }
        if k == 0 || k > 256 {
            return Err(VectorDbError::InvalidArgument(format!(
                "centroid count {k} must be in 1..=256"
            )));
        }
        Ok(Self {
            d,
            m,
            k,
            sub_dim: d / m,
            codebooks: Vec::new(),
            trained: false,
        })
    }

    /// Whether this quantizer has trained codebooks.
    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Number of subspaces (`M`).
    pub fn m(&self) -> usize {
        self.m
    }

    /// Centroids per subspace (`K`).
    pub fn k(&self) -> usize {
        self.k
    }

    /// Full vector dimension (`D`).
    pub fn d(&self) -> usize {
        self.d
    }

    /// Train the `M` subspace codebooks on `training_vectors` via
    /// k-means (k-means++ seeding, Lloyd iterations, convergence at
    /// relative inertia delta below `1e-4` or 25 iterations).
    ///
    /// # Errors
    /// - [`VectorDbError::InvalidArgument`] if any training vector's
    ///   length isn't `D`, or `N < K` (insufficient training data).
    /// - [`VectorDbError::AlreadyTrained`] if this quantizer was
    ///   already trained.
    pub fn train(&mut self, training_vectors: &[Vec<f32>], seed: u64) -> Result<()> {
        if self.trained {
            return Err(VectorDbError::AlreadyTrained);
        }
        if training_vectors.len() < self.k {
            return Err(VectorDbError::InvalidArgument(format!(
                "need at least {} training vectors, got {}",
                self.k,
                training_vectors.len()
            )));
        }
        for v in training_vectors {
            if v.len() != self.d {
                return Err(VectorDbError::InvalidArgument(format!(
                    "training vector has length {}, expected {}",
                    v.len(),
                    self.d
                )));
            }
        }

        let mut codebooks = Vec::with_capacity(self.m);
        for sub in 0..self.m {
            let start = sub * self.sub_dim;
            let end = start + self.sub_dim;
            let sub_vectors: Vec<&[f32]> = training_vectors
                .iter()
                .map(|v| &v[start..end])
                .collect();
            let centroids = kmeans(&sub_vectors, self.k, seed.wrapping_add(sub as u64));
            codebooks.push(centroids);
        }

        self.codebooks = codebooks;
        self.trained = true;
        Ok(())
    }

    /// Encode a full-length vector into `M` code bytes, one nearest
    /// centroid index per subspace.
    ///
    /// # Errors
    /// [`VectorDbError::NotTrained`] if codebooks haven't been trained;
    /// [`VectorDbError::InvalidArgument`] if `v.len() != D`.
    pub fn encode(&self, v: &[f32]) -> Result<Vec<u8>> {
        if !self.trained {
            return Err(VectorDbError::NotTrained);
        }
        if v.len() != self.d {
            return Err(VectorDbError::InvalidArgument(format!(
                "vector has length {}, expected {}",
                v.len(),
                self.d
            )));
        }

        let mut code = Vec::with_capacity(self.m);
        for sub in 0..self.m {
            let start = sub * self.sub_dim;
            let end = start + self.sub_dim;
            let sub_vector = &v[start..end];
            let nearest = nearest_centroid(sub_vector, &self.codebooks[sub]);
            code.push(nearest as u8);
        }
        Ok(code)
    }

    /// Decode `M` code bytes back into a full-length vector by
    /// concatenating the selected centroids.
    ///
    /// # Errors
    /// [`VectorDbError::NotTrained`] if codebooks haven't been trained;
    /// [`VectorDbError::InvalidArgument`] if `code.len() != M`.
    pub fn decode(&self, code: &[u8]) -> Result<Vec<f32>> {
        if !self.trained {
            return Err(VectorDbError::NotTrained);
        }
        if code.len() != self.m {
            return Err(VectorDbError::InvalidArgument(format!(
                "code has length {}, expected {}",
                code.len(),
                self.m
            )));
        }
        let mut out = Vec::with_capacity(self.d);
        for (sub, &byte) in code.iter().enumerate() {
            out.extend_from_slice(&self.codebooks[sub][byte as usize]);
        }
        Ok(out)
    }

    /// Precompute an `M x K` asymmetric distance table for `query`:
    /// `table[sub][c]` is the squared L2 distance from `query`'s
    /// `sub`-th subvector to centroid `c` of that subspace.
    ///
    /// # Errors
    /// [`VectorDbError::NotTrained`] if codebooks haven't been trained;
    /// [`VectorDbError::InvalidArgument`] if `query.len() != D`.
    pub fn distance_table(&self, query: &[f32]) -> Result<Vec<Vec<f32>>> {
        if !self.trained {
            return Err(VectorDbError::NotTrained);
        }
        if query.len() != self.d {
            return Err(VectorDbError::InvalidArgument(format!(
                "query has length {}, expected {}",
                query.len(),
                self.d
            )));
        }
        let mut table = Vec::with_capacity(self.m);
        for sub in 0..self.m {
            let start = sub * self.sub_dim;
            let end = start + self.sub_dim;
            let sub_query = &query[start..end];
            let row: Vec<f32> = self.codebooks[sub]
                .iter()
                .map(|c| squared_l2(sub_query, c))
                .collect();
            table.push(row);
        }
        Ok(table)
    }

    /// Score a code against a precomputed [`distance_table`] by
    /// summing `table[sub][code[sub]]` across subspaces. Lower is
    /// closer.
    pub fn score_with_table(table: &[Vec<f32>], code: &[u8]) -> f32 {
        table
            .iter()
            .zip(code)
            .map(|(row, &c)| row[c as usize])
            .sum()
    }

    /// Rank `codes` (paired with stable IDs) against `query` by
    /// ascending asymmetric distance, breaking ties by ascending ID
    /// for deterministic ordering. Returns the `top_k` best (id,
    /// distance) pairs.
    ///
    /// # Errors
    /// Propagates errors from [`distance_table`].
    pub fn search<'a>(
        &self,
        query: &[f32],
        codes: impl Iterator<Item = (&'a str, &'a [u8])>,
        top_k: usize,
    ) -> Result<Vec<(String, f32)>> {
        let table = self.distance_table(query)?;
        let mut scored: Vec<(String, f32)> = codes
            .map(|(id, code)| (id.to_string(), Self::score_with_table(&table, code)))
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest_centroid(v: &[f32], centroids: &[Vec<f32>]) -> usize {
    centroids
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            squared_l2(v, a)
                .partial_cmp(&squared_l2(v, b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// k-means with k-means++ seeding and Lloyd iterations, run once per
/// subspace during [`ProductQuantizer::train`].
fn kmeans(vectors: &[&[f32]], k: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = kmeans_plus_plus_init(vectors, k, &mut rng);

    let mut prev_inertia = f32::INFINITY;
    for _ in 0..MAX_KMEANS_ITERS {
        let mut assignments = vec![0usize; vectors.len()];
        let mut inertia = 0.0f32;
        for (i, v) in vectors.iter().enumerate() {
            let c = nearest_centroid(v, &centroids);
            assignments[i] = c;
            inertia += squared_l2(v, &centroids[c]);
        }

        let dim = centroids[0].len();
        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (v, &c) in vectors.iter().zip(&assignments) {
            counts[c] += 1;
            for (s, &x) in sums[c].iter_mut().zip(*v) {
                *s += x;
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                for s in sums[c].iter_mut() {
                    *s /= counts[c] as f32;
                }
                centroids[c] = sums[c].clone();
            }
            // Empty clusters keep their previous centroid untouched;
            // re-seeding empty clusters is not needed at the scales
            // this quantizer targets (K <= 256).
        }

        let rel_change = (prev_inertia - inertia).abs() / prev_inertia.max(1e-12);
        prev_inertia = inertia;
        if rel_change < INERTIA_TAU {
            break;
        }
    }

    centroids
}

/// k-means++ seeding: the first centroid is picked uniformly; each
/// subsequent centroid is picked with probability proportional to its
/// squared distance from the nearest already-chosen centroid.
fn kmeans_plus_plus_init(vectors: &[&[f32]], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    let first = rng.gen_range(0..vectors.len());
    centroids.push(vectors[first].to_vec());

    while centroids.len() < k {
        let weights: Vec<f32> = vectors
            .iter()
            .map(|v| {
                centroids
                    .iter()
                    .map(|c| squared_l2(v, c))
                    .fold(f32::INFINITY, f32::min)
            })
            .collect();
        let total: f32 = weights.iter().sum();
        if total < 1e-12 {
            // All remaining points coincide with an existing centroid;
            // fall back to uniform sampling.
            let idx = rng.gen_range(0..vectors.len());
            centroids.push(vectors[idx].to_vec());
            continue;
        }
        let mut target = rng.gen_range(0.0..total);
        let mut chosen = vectors.len() - 1;
        for (i, &w) in weights.iter().enumerate() {
            if target < w {
                chosen = i;
                break;
            }
            target -= w;
        }
        centroids.push(vectors[chosen].to_vec());
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_clusters(n_per_cluster: usize, d: usize, centers: &[Vec<f32>]) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut out = Vec::new();
        for center in centers {
            for _ in 0..n_per_cluster {
                let v: Vec<f32> = center
                    .iter()
                    .map(|&c| c + rng.gen_range(-0.01..0.01))
                    .collect();
                debug_assert_eq!(v.len(), d);
                out.push(v);
            }
        }
        out
    }

    #[test]
    fn rejects_non_divisible_dimension() {
        assert!(ProductQuantizer::new(10, 3, 16).is_err());
    }

    #[test]
    fn rejects_k_above_256() {
        assert!(ProductQuantizer::new(8, 2, 300).is_err());
    }

    #[test]
    fn train_fails_with_too_few_vectors() {
        let mut pq = ProductQuantizer::new(4, 2, 16).unwrap();
        let data = vec![vec![0.0; 4]; 4];
        assert!(pq.train(&data, 1).is_err());
    }

    #[test]
    fn encode_decode_round_trip_is_close() {
        let d = 8;
        let centers = vec![vec![0.0; d], vec![5.0; d], vec![-5.0; d], vec![10.0; d]];
        let data = synthetic_clusters(64, d, &centers);
        let mut pq = ProductQuantizer::new(d, 2, 4).unwrap();
        pq.train(&data, 42).unwrap();

        let sample = &data[0];
        let code = pq.encode(sample).unwrap();
        assert_eq!(code.len(), 2);
        let decoded = pq.decode(&code).unwrap();
        let mse: f32 = sample
            .iter()
            .zip(&decoded)
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            / d as f32;
        assert!(mse < 1.0, "mse too high: {mse}");
    }

    #[test]
    fn asymmetric_search_orders_by_ascending_distance_with_id_tiebreak() {
        let d = 4;
        let centers = vec![vec![0.0; d], vec![10.0; d]];
        let data = synthetic_clusters(32, d, &centers);
        let mut pq = ProductQuantizer::new(d, 2, 2).unwrap();
        pq.train(&data, 1).unwrap();

        let codes: Vec<(String, Vec<u8>)> = data
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("id{i}"), pq.encode(v).unwrap()))
            .collect();
        let refs: Vec<(&str, &[u8])> = codes.iter().map(|(id, c)| (id.as_str(), c.as_slice())).collect();

        let query = vec![0.0; d];
        let results = pq.search(&query, refs.into_iter(), 5).unwrap();
        assert_eq!(results.len(), 5);
        for w in results.windows(2) {
            assert!(w[0].1 <= w[1].1);
        }
    }

    #[test]
    fn operations_on_untrained_quantizer_error() {
        let pq = ProductQuantizer::new(8, 2, 16).unwrap();
        assert!(pq.encode(&[0.0; 8]).is_err());
        assert!(pq.decode(&[0, 0]).is_err());
    }
}
