//! Agglomerative clustering on a precomputed distance matrix.
//!
//! Every item starts as its own cluster. The closest pair of clusters is
//! merged until the closest remaining pair is further apart than the
//! distance threshold, or a single cluster is left.
//!
//! Inter-cluster distances are kept in a dense matrix and updated after each
//! merge with the Lance-Williams formula for the chosen [`Linkage`]. Each
//! active cluster caches its nearest neighbour, so finding the next merge is
//! a linear scan and only rows whose neighbour was touched get rescanned.
//!
//! Ties on the minimal distance go to the pair with the lowest
//! `(lower id, higher id)`, where a cluster's id is its smallest member index.
//! Labels are numbered in order of first appearance.

use log::{debug, info};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::config::Linkage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterResult {
    /// Cluster label for each item, in input order.
    pub labels: Vec<usize>,
    pub n_clusters: usize,
}

impl ClusterResult {
    fn empty() -> Self {
        Self {
            labels: Vec::new(),
            n_clusters: 0,
        }
    }
}

/// Cluster `n` items given their `n x n` distance matrix.
///
/// The matrix is expected to be symmetric and non-negative with a zero
/// diagonal; this is only checked in debug builds.
pub fn cluster(
    distance: ArrayView2<'_, f32>,
    distance_threshold: f64,
    linkage: Linkage,
) -> ClusterResult {
    let n = distance.nrows();
    debug_assert_eq!(n, distance.ncols(), "distance matrix must be square");
    debug_assert!(
        is_well_formed(&distance),
        "distance matrix must be symmetric and non-negative"
    );

    match n {
        0 => return ClusterResult::empty(),
        1 => {
            info!("Single photo, assigned to cluster 0");
            return ClusterResult {
                labels: vec![0],
                n_clusters: 1,
            };
        }
        _ => {}
    }

    // Compared at the matrix's precision so a stored 0.2 merges at threshold 0.2.
    let cutoff = distance_threshold as f32;
    let mut state = MergeState::new(&distance);
    let mut merges = 0;
    while let Some((a, b, d)) = state.closest_pair() {
        if d as f32 > cutoff {
            debug!(
                "Stopping after {} merges: closest pair ({}, {}) at {:.4} exceeds {:.4}",
                merges, a, b, d, distance_threshold
            );
            break;
        }
        state.merge(a, b, linkage);
        merges += 1;
    }

    let result = state.into_result();
    info!(
        "Agglomerative clustering found {} clusters (threshold={:.3}, linkage={})",
        result.n_clusters, distance_threshold, linkage
    );
    result
}

fn is_well_formed(distance: &ArrayView2<'_, f32>) -> bool {
    let n = distance.nrows();
    (0..n).all(|i| {
        (0..n).all(|j| {
            let d = distance[[i, j]];
            d >= 0.0 && (d - distance[[j, i]]).abs() <= 1e-5
        })
    })
}

/// Working state of one clustering run.
///
/// Cluster `i` is identified by its smallest member index, which is also the
/// row it occupies in `dist`. When `a < b` merge, `a` survives.
struct MergeState {
    n: usize,
    dist: Vec<f64>,
    active: Vec<bool>,
    size: Vec<usize>,
    /// Item `i` belongs to the cluster at `parent[i]` after path compression.
    parent: Vec<usize>,
    nearest: Vec<Option<(usize, f64)>>,
}

impl MergeState {
    fn new(distance: &ArrayView2<'_, f32>) -> Self {
        let n = distance.nrows();
        let dist = distance.iter().map(|d| f64::from(*d)).collect();
        let mut state = Self {
            n,
            dist,
            active: vec![true; n],
            size: vec![1; n],
            parent: (0..n).collect(),
            nearest: vec![None; n],
        };
        for i in 0..n {
            state.rescan(i);
        }
        state
    }

    fn get(&self, i: usize, j: usize) -> f64 {
        self.dist[i * self.n + j]
    }

    fn set(&mut self, i: usize, j: usize, d: f64) {
        self.dist[i * self.n + j] = d;
        self.dist[j * self.n + i] = d;
    }

    /// Recompute the nearest active neighbour of `i` from scratch.
    fn rescan(&mut self, i: usize) {
        let mut best: Option<(usize, f64)> = None;
        for j in 0..self.n {
            if j == i || !self.active[j] {
                continue;
            }
            let d = self.get(i, j);
            // Strict comparison keeps the lowest index among ties.
            if best.is_none_or(|(_, bd)| d < bd) {
                best = Some((j, d));
            }
        }
        self.nearest[i] = best;
    }

    /// The next pair to merge as `(lower id, higher id, distance)`.
    fn closest_pair(&self) -> Option<(usize, usize, f64)> {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in (0..self.n).filter(|&i| self.active[i]) {
            let Some((j, d)) = self.nearest[i] else {
                continue;
            };
            let (lo, hi) = if i < j { (i, j) } else { (j, i) };
            let better = match best {
                None => true,
                Some((blo, bhi, bd)) => d < bd || (d == bd && (lo, hi) < (blo, bhi)),
            };
            if better {
                best = Some((lo, hi, d));
            }
        }
        best
    }

    fn merge(&mut self, a: usize, b: usize, linkage: Linkage) {
        debug_assert!(a < b && self.active[a] && self.active[b]);
        let (size_a, size_b) = (self.size[a] as f64, self.size[b] as f64);

        for k in 0..self.n {
            if k == a || k == b || !self.active[k] {
                continue;
            }
            let (d_ak, d_bk) = (self.get(a, k), self.get(b, k));
            let merged = match linkage {
                Linkage::Single => d_ak.min(d_bk),
                Linkage::Complete => d_ak.max(d_bk),
                Linkage::Average => (size_a * d_ak + size_b * d_bk) / (size_a + size_b),
            };
            self.set(a, k, merged);
        }

        self.active[b] = false;
        self.nearest[b] = None;
        self.size[a] += self.size[b];
        self.parent[b] = a;
        self.rescan(a);

        for k in 0..self.n {
            if k == a || !self.active[k] {
                continue;
            }
            match self.nearest[k] {
                Some((j, _)) if j == a || j == b => self.rescan(k),
                Some((j, d)) => {
                    let d_ak = self.get(a, k);
                    if d_ak < d || (d_ak == d && a < j) {
                        self.nearest[k] = Some((a, d_ak));
                    }
                }
                None => self.rescan(k),
            }
        }
    }

    fn root(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn into_result(mut self) -> ClusterResult {
        let mut label_of_root = vec![None; self.n];
        let mut labels = Vec::with_capacity(self.n);
        let mut n_clusters = 0;
        for i in 0..self.n {
            let root = self.root(i);
            let label = *label_of_root[root].get_or_insert_with(|| {
                n_clusters += 1;
                n_clusters - 1
            });
            labels.push(label);
        }
        ClusterResult { labels, n_clusters }
    }
}
